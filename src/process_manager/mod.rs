//! Process managers (sagas): long-running workflows correlated across
//! messages and persisted between them.
//!
//! An instance moves through `NotFound -> Started -> Updated* -> Completed`.
//! The [`ProcessManagerRuntime`] locates the instance for an incoming message
//! through the [`ProcessManagerFinder`], runs the transition and persists the
//! result with an optimistic version check.
//!
//! ## Example
//!
//! ```ignore
//! #[derive(Serialize, Deserialize, Clone, Default)]
//! struct Fulfillment { paid: bool, shipped: bool }
//!
//! impl ProcessManagerData for Fulfillment {
//!     const COLLECTION: &'static str = "fulfillments";
//! }
//!
//! struct FulfillmentSaga;
//!
//! impl ProcessManager<OrderPlaced> for FulfillmentSaga {
//!     type Data = Fulfillment;
//!     fn correlation_key(&self, msg: &OrderPlaced, _: &Context) -> String { msg.order_id.clone() }
//!     fn is_starter(&self) -> bool { true }
//!     fn new_data(&self, _: &str, _: &OrderPlaced) -> Result<Fulfillment, HandlerError> {
//!         Ok(Fulfillment::default())
//!     }
//!     fn handle(&self, _: &mut Fulfillment, _: &OrderPlaced, _: &Context) -> Result<Transition, HandlerError> {
//!         Ok(Transition::Continue)
//!     }
//! }
//! ```

mod finder;
mod in_memory;
mod runtime;
mod store;

use std::collections::VecDeque;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::bus::Context;
use crate::error::HandlerError;
use crate::message::Message;
use crate::serializer::{JsonSerializer, Serializer};

pub use finder::{FindResult, ProcessManagerFinder};
pub use in_memory::InMemoryProcessManagerStore;
pub use runtime::{ProcessManagerRuntime, DEFAULT_MAX_CONCURRENCY_RETRIES};
pub use store::ProcessManagerStore;

/// How many applied message ids an instance remembers for duplicate detection.
pub const HANDLED_WINDOW: usize = 64;

/// Persisted saga state.
pub trait ProcessManagerData: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Collection (table, key prefix) the instances are stored under.
    const COLLECTION: &'static str;
}

/// A value with its optimistic concurrency token.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub data: T,
    pub version: u64,
}

/// What the store holds for one instance: the workflow data plus the ids of
/// the most recently applied messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord<D> {
    pub key: String,
    pub data: D,
    #[serde(default)]
    pub handled: VecDeque<String>,
}

impl<D> ProcessRecord<D> {
    pub fn new(key: impl Into<String>, data: D) -> Self {
        Self {
            key: key.into(),
            data,
            handled: VecDeque::new(),
        }
    }

    pub fn has_handled(&self, message_id: &str) -> bool {
        !message_id.is_empty() && self.handled.iter().any(|id| id == message_id)
    }

    pub fn record_handled(&mut self, message_id: &str) {
        if message_id.is_empty() {
            return;
        }
        self.handled.push_back(message_id.to_string());
        while self.handled.len() > HANDLED_WINDOW {
            self.handled.pop_front();
        }
    }
}

/// Result of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Persist the updated state and keep the instance alive.
    Continue,
    /// The workflow is finished; delete the instance.
    Complete,
}

/// What the runtime did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Started,
    Updated,
    Completed,
    /// The message was already applied to this instance.
    Duplicate,
}

/// Handler side of a saga for message type `M`.
///
/// A saga handling several message types implements this once per type, so
/// the correlation mapping and the starter flag are per message type.
pub trait ProcessManager<M: Message, S: Serializer = JsonSerializer>: Send + Sync + 'static {
    type Data: ProcessManagerData;

    /// Map the message to the instance it belongs to.
    fn correlation_key(&self, message: &M, ctx: &Context<'_, S>) -> String;

    /// Whether `M` may create a new instance.
    fn is_starter(&self) -> bool {
        false
    }

    /// Initial state for a new instance. Only called for starters.
    fn new_data(&self, key: &str, message: &M) -> Result<Self::Data, HandlerError> {
        let _ = (key, message);
        Err(HandlerError::Rejected(format!(
            "{} does not start a process",
            M::type_name()
        )))
    }

    /// Apply the message to the instance state.
    fn handle(
        &self,
        data: &mut Self::Data,
        message: &M,
        ctx: &Context<'_, S>,
    ) -> Result<Transition, HandlerError>;
}
