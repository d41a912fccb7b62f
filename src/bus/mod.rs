//! Bus: the composition root.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Bus (per service)                       │
//! │  send / publish / send_request / start_consuming / dispose   │
//! └─────────────────────────────────────────────────────────────┘
//!        │                 │                    │
//!        ▼                 ▼                    ▼
//! ┌─────────────┐  ┌────────────────┐  ┌─────────────────────────┐
//! │  Producer   │  │   Consumer     │  │  Correlator             │
//! │             │  │  flows, retry  │  │  pending requests       │
//! └─────────────┘  └────────────────┘  └─────────────────────────┘
//!                          │
//!                          ▼
//!            ┌───────────────────────────────┐
//!            │  HandlerResolver → handlers,   │
//!            │  process managers, aggregators │
//!            └───────────────────────────────┘
//! ```
//!
//! Every delivered message is first offered to the correlator; replies to
//! pending requests stop there. Everything else is dispatched to the
//! handlers registered for its type name.

mod builder;
#[allow(clippy::module_inception)]
mod bus;
mod context;
mod handler;
mod registry;

use crate::aggregator::AggregatorReaper;
use crate::error::BusError;

pub use builder::BusBuilder;
pub use bus::Bus;
pub use context::Context;
pub use handler::{handle_fn, FnHandler, Handler, MessageHandler};
pub use registry::{HandlerRegistry, HandlerResolver};

pub use crate::consumer::{ConsumerStats, ErrorReport};

pub(crate) use handler::TypedHandler;

/// Starts one aggregator reaper when the bus starts consuming.
pub(crate) type ReaperFactory = Box<dyn Fn() -> Result<AggregatorReaper, BusError> + Send + Sync>;
