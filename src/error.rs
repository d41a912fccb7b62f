//! Error types for the bus runtime.
//!
//! Each concern has its own enum (transport, persistence, handlers) and they
//! all fold into [`BusError`], which is what the public surface returns.

use std::error::Error;
use std::time::Duration;

use thiserror::Error;

use crate::lock::LockError;

/// Errors raised by a [`Transport`](crate::transport::Transport) implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connection to the broker dropped. Consumers reconnect with backoff.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// The transport has been closed and accepts no more work.
    #[error("transport closed")]
    Closed,
    /// Ack/nack for a delivery the transport does not know about.
    #[error("unknown delivery {tag} on queue {queue}")]
    UnknownDelivery { queue: String, tag: u64 },
    #[error("transport lock poisoned during {0}")]
    LockPoisoned(&'static str),
    #[error("transport error: {0}")]
    Other(String),
}

/// Errors raised by process manager stores and aggregator persistors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Optimistic concurrency conflict.
    #[error("concurrency conflict on {collection}:{id} (expected version {expected}, actual {actual})")]
    ConcurrencyConflict {
        collection: String,
        id: String,
        expected: u64,
        actual: u64,
    },
    #[error("not found: {collection}:{id}")]
    NotFound { collection: String, id: String },
    #[error("store serialization error: {0}")]
    Serde(String),
    #[error("store error: {0}")]
    Storage(String),
}

/// Error returned by application handlers.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Business logic rejected the message.
    #[error("rejected: {0}")]
    Rejected(String),
    /// The handler could not interpret part of the message.
    #[error("decode failed: {0}")]
    DecodeFailed(String),
    /// A bus operation issued from inside the handler failed.
    #[error("bus error: {0}")]
    Bus(Box<BusError>),
    #[error("handler error: {0}")]
    Other(Box<dyn Error + Send + Sync>),
}

impl From<BusError> for HandlerError {
    fn from(err: BusError) -> Self {
        HandlerError::Bus(Box::new(err))
    }
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        HandlerError::Bus(Box::new(BusError::from(err)))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::DecodeFailed(err.to_string())
    }
}

/// Top-level error for every bus operation.
#[derive(Debug, Error)]
pub enum BusError {
    /// Poison message: the payload cannot be decoded. Never retried.
    #[error("failed to deserialize {message_type}: {reason}")]
    DeserializationFailed {
        message_type: String,
        reason: String,
    },
    #[error("failed to serialize {message_type}: {reason}")]
    SerializationFailed {
        message_type: String,
        reason: String,
    },
    /// A handler returned an error. Retried up to `max_retries`.
    #[error("handler for {message_type} failed: {reason}")]
    HandlerFailed {
        message_type: String,
        reason: String,
    },
    #[error("payload of {size} bytes exceeds the maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("request {correlation_id} timed out after {timeout:?}")]
    TimedOut {
        correlation_id: String,
        timeout: Duration,
    },
    #[error("request {0} cancelled")]
    Cancelled(String),
    /// The message correlates to a process manager instance that does not
    /// exist, and the message does not start one.
    #[error("no {collection} instance for key {key} and {message_type} does not start one")]
    ConsistencyViolation {
        collection: String,
        key: String,
        message_type: String,
    },
    #[error("concurrency conflict on {collection}:{key} after {attempts} attempt(s)")]
    ConcurrencyConflict {
        collection: String,
        key: String,
        attempts: u32,
    },
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("header {0} is reserved by the bus")]
    HeaderCollision(String),
    #[error("no handlers registered for {0}")]
    NoHandlers(String),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("bus is disposed")]
    Disposed,
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Transport(TransportError),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Lock(#[from] LockError),
}

impl From<TransportError> for BusError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConnectionLost(reason) => BusError::ConnectionLost(reason),
            TransportError::Closed => BusError::Disposed,
            other => BusError::Transport(other),
        }
    }
}

impl From<StoreError> for BusError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConcurrencyConflict { collection, id, .. } => {
                BusError::ConcurrencyConflict {
                    collection,
                    key: id,
                    attempts: 1,
                }
            }
            other => BusError::Store(other),
        }
    }
}

/// Stable failure classification written to error-queue headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    DeserializationFailed,
    HandlerFailed,
    PayloadTooLarge,
    TimedOut,
    Cancelled,
    ConsistencyViolation,
    ConcurrencyConflict,
    ConnectionLost,
    NoHandlers,
    Other,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::DeserializationFailed => "DeserializationFailed",
            FailureKind::HandlerFailed => "HandlerFailed",
            FailureKind::PayloadTooLarge => "PayloadTooLarge",
            FailureKind::TimedOut => "TimedOut",
            FailureKind::Cancelled => "Cancelled",
            FailureKind::ConsistencyViolation => "ConsistencyViolation",
            FailureKind::ConcurrencyConflict => "ConcurrencyConflict",
            FailureKind::ConnectionLost => "ConnectionLost",
            FailureKind::NoHandlers => "NoHandlers",
            FailureKind::Other => "Other",
        }
    }

    /// Whether a delivery failing with this kind is worth redelivering.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            FailureKind::DeserializationFailed
                | FailureKind::ConsistencyViolation
                | FailureKind::NoHandlers
        )
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BusError {
    pub fn kind(&self) -> FailureKind {
        match self {
            BusError::DeserializationFailed { .. } => FailureKind::DeserializationFailed,
            BusError::HandlerFailed { .. } => FailureKind::HandlerFailed,
            BusError::PayloadTooLarge { .. } => FailureKind::PayloadTooLarge,
            BusError::TimedOut { .. } => FailureKind::TimedOut,
            BusError::Cancelled(_) => FailureKind::Cancelled,
            BusError::ConsistencyViolation { .. } => FailureKind::ConsistencyViolation,
            BusError::ConcurrencyConflict { .. } => FailureKind::ConcurrencyConflict,
            BusError::ConnectionLost(_) => FailureKind::ConnectionLost,
            BusError::NoHandlers(_) => FailureKind::NoHandlers,
            _ => FailureKind::Other,
        }
    }

    /// Wrap a handler error for the given message type.
    ///
    /// Bus errors raised inside the handler keep their own classification so
    /// that, for example, a consistency violation is not retried.
    pub fn from_handler(message_type: &str, err: HandlerError) -> Self {
        match err {
            HandlerError::Bus(inner) => match *inner {
                err @ (BusError::ConsistencyViolation { .. }
                | BusError::DeserializationFailed { .. }
                | BusError::ConcurrencyConflict { .. }) => err,
                other => BusError::HandlerFailed {
                    message_type: message_type.to_string(),
                    reason: other.to_string(),
                },
            },
            other => BusError::HandlerFailed {
                message_type: message_type.to_string(),
                reason: other.to_string(),
            },
        }
    }
}
