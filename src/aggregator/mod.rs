//! Scatter-gather aggregation.
//!
//! An [`Aggregator`] collects correlated messages into an
//! [`AggregatorSession`] until its completion predicate holds, then receives
//! every part at once in append order. Sessions that never complete are
//! reaped after a timeout and handed to [`Aggregator::timed_out`].

mod in_memory;
mod persistor;
mod processor;
mod reaper;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::bus::Context;
use crate::error::HandlerError;
use crate::message::Message;
use crate::producer::now_millis;
use crate::serializer::{JsonSerializer, Serializer};

pub use in_memory::InMemoryAggregatorPersistor;
pub use persistor::AggregatorPersistor;
pub use processor::{AggregateOutcome, AggregatorProcessor};
pub use reaper::{AggregatorReaper, ReaperStats};

/// Parts collected so far for one correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorSession<M> {
    pub correlation_id: String,
    pub message_ids: Vec<String>,
    pub messages: Vec<M>,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at_ms: u64,
}

impl<M> AggregatorSession<M> {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            message_ids: Vec::new(),
            messages: Vec::new(),
            created_at_ms: now_millis() as u64,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        !message_id.is_empty() && self.message_ids.iter().any(|id| id == message_id)
    }

    pub fn push(&mut self, message_id: impl Into<String>, message: M) {
        self.message_ids.push(message_id.into());
        self.messages.push(message);
    }

    pub fn age(&self) -> Duration {
        Duration::from_millis((now_millis() as u64).saturating_sub(self.created_at_ms))
    }
}

/// Scatter-gather handler for parts of type `M`.
pub trait Aggregator<M: Message, S: Serializer = JsonSerializer>: Send + Sync + 'static {
    /// Which session a part belongs to. Defaults to the message's
    /// correlation id.
    fn correlation_id(&self, message: &M, ctx: &Context<'_, S>) -> String {
        let _ = message;
        ctx.correlation_id().to_string()
    }

    /// Completion predicate, evaluated after every append.
    fn is_complete(&self, session: &AggregatorSession<M>) -> bool;

    /// Called once with every part, in append order.
    fn complete(&self, messages: Vec<M>, ctx: &Context<'_, S>) -> Result<(), HandlerError>;

    /// Called for a session reaped after the timeout.
    fn timed_out(&self, session: AggregatorSession<M>) {
        warn!(
            correlation_id = %session.correlation_id,
            parts = session.len(),
            message_type = M::type_name(),
            "aggregator session timed out"
        );
    }
}
