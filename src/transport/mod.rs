//! Transport abstraction.
//!
//! A transport moves [`TransportMessage`]s between named queues and topics.
//! The bus only relies on this trait, so a broker client and the in-memory
//! implementation are interchangeable.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Bus / Producer / Consumer              │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Transport trait                        │
//! │  send(queue) / publish(topic) / bind(queue, topic)            │
//! │  listen(queue, timeout) / ack(delivery) / nack(delivery)      │
//! └──────────────────────────────────────────────────────────────┘
//!            │                                     │
//!            ▼                                     ▼
//! ┌────────────────────┐               ┌────────────────────────┐
//! │ InMemoryTransport  │               │  broker client         │
//! │    (included)      │               │   (external)           │
//! └────────────────────┘               └────────────────────────┘
//! ```

mod in_memory;

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::TransportError;
use crate::message::TransportMessage;

pub use in_memory::InMemoryTransport;

/// Default payload ceiling for transports that do not report one.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024;

/// A message handed to a consumer, pending ack or nack.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// Transport-assigned tag identifying this delivery for ack/nack.
    pub tag: u64,
    pub queue: String,
    pub message: TransportMessage,
    /// True if the message was delivered before and not acknowledged.
    pub redelivered: bool,
}

/// Queue declaration options.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: BTreeMap<String, String>,
}

/// Point-to-point and fan-out message transport.
///
/// `send` delivers to exactly one named queue. `publish` copies the message
/// to every queue bound to the topic and returns how many received it.
/// Deliveries obtained through `listen` stay unacknowledged until `ack` or
/// `nack` is called with their tag.
pub trait Transport: Send + Sync + 'static {
    /// Create the queue if it does not exist. Idempotent.
    fn declare_queue(&self, queue: &str, options: &QueueOptions) -> Result<(), TransportError>;

    fn send(&self, queue: &str, message: TransportMessage) -> Result<(), TransportError>;

    fn publish(&self, topic: &str, message: TransportMessage) -> Result<usize, TransportError>;

    /// Route messages published to `topic` into `queue`.
    fn bind(&self, queue: &str, topic: &str) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next message on `queue`.
    fn listen(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>, TransportError>;

    fn ack(&self, delivery: &Delivery) -> Result<(), TransportError>;

    /// Reject a delivery. With `requeue` it becomes available again,
    /// otherwise it is dropped.
    fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError>;

    /// Remove every ready message from `queue`, returning how many were dropped.
    fn purge(&self, queue: &str) -> Result<usize, TransportError>;

    fn max_message_size(&self) -> usize {
        DEFAULT_MAX_MESSAGE_SIZE
    }

    /// Re-establish a lost connection.
    fn reconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

impl<T: Transport> Transport for std::sync::Arc<T> {
    fn declare_queue(&self, queue: &str, options: &QueueOptions) -> Result<(), TransportError> {
        (**self).declare_queue(queue, options)
    }

    fn send(&self, queue: &str, message: TransportMessage) -> Result<(), TransportError> {
        (**self).send(queue, message)
    }

    fn publish(&self, topic: &str, message: TransportMessage) -> Result<usize, TransportError> {
        (**self).publish(topic, message)
    }

    fn bind(&self, queue: &str, topic: &str) -> Result<(), TransportError> {
        (**self).bind(queue, topic)
    }

    fn listen(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>, TransportError> {
        (**self).listen(queue, timeout)
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        (**self).ack(delivery)
    }

    fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError> {
        (**self).nack(delivery, requeue)
    }

    fn purge(&self, queue: &str) -> Result<usize, TransportError> {
        (**self).purge(queue)
    }

    fn max_message_size(&self) -> usize {
        (**self).max_message_size()
    }

    fn reconnect(&self) -> Result<(), TransportError> {
        (**self).reconnect()
    }

    fn close(&self) -> Result<(), TransportError> {
        (**self).close()
    }
}
