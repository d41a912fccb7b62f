//! Message bus runtime: point-to-point send, publish/subscribe,
//! request/reply, process managers and scatter-gather aggregation over a
//! pluggable [`Transport`](transport::Transport).

extern crate self as sourced_bus;

pub mod aggregator;
pub mod bus;
pub mod consumer;
mod error;
pub mod lock;
mod message;
pub mod process_manager;
mod producer;
pub mod request_reply;
mod serializer;
mod settings;
pub mod transport;

pub use bus::{handle_fn, Bus, BusBuilder, Context, Handler, HandlerRegistry, HandlerResolver};
pub use consumer::{ConsumeOptions, Consumer, ConsumerStats, ErrorReport};
pub use error::{BusError, FailureKind, HandlerError, StoreError, TransportError};
pub use message::{headers, Envelope, Message, TransportMessage};
pub use producer::{Outbound, Producer, HEARTBEAT_TYPE};
pub use serializer::{JsonSerializer, Serializer};
#[cfg(feature = "bitcode")]
pub use serializer::BitcodeSerializer;
pub use settings::{QueueMappings, TransportSettings};

// Derive macro for `Message`
pub use sourced_bus_macros::Message;
