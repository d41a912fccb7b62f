//! Handler resolution and dispatch.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use super::{Context, MessageHandler};
use crate::error::BusError;
use crate::serializer::{JsonSerializer, Serializer};

/// Maps a message type name to the handlers that process it.
///
/// [`HandlerRegistry`] is the built-in implementation. Applications that
/// resolve handlers from their own container implement this directly.
pub trait HandlerResolver<S: Serializer = JsonSerializer>: Send + Sync + 'static {
    /// Handlers for `message_type`, in the order they should run.
    fn resolve(&self, message_type: &str) -> Vec<Arc<dyn MessageHandler<S>>>;

    /// Every type name with at least one handler. The bus subscribes its
    /// queue to these topics.
    fn message_types(&self) -> Vec<String>;
}

/// Handlers keyed by message type, run in registration order.
pub struct HandlerRegistry<S: Serializer = JsonSerializer> {
    handlers: BTreeMap<String, Vec<Arc<dyn MessageHandler<S>>>>,
}

impl<S: Serializer> Default for HandlerRegistry<S> {
    fn default() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }
}

impl<S: Serializer> HandlerRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn MessageHandler<S>>) -> &mut Self {
        self.handlers
            .entry(handler.message_type().to_string())
            .or_default()
            .push(handler);
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<S: Serializer> HandlerResolver<S> for HandlerRegistry<S> {
    fn resolve(&self, message_type: &str) -> Vec<Arc<dyn MessageHandler<S>>> {
        self.handlers.get(message_type).cloned().unwrap_or_default()
    }

    fn message_types(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

/// Run every handler for the context's message type in order, stopping at
/// the first failure. Returns how many handlers ran.
pub(crate) fn dispatch<S: Serializer>(
    resolver: &dyn HandlerResolver<S>,
    ctx: &Context<'_, S>,
) -> Result<usize, BusError> {
    let handlers = resolver.resolve(ctx.message_type());
    if handlers.is_empty() {
        return Err(BusError::NoHandlers(ctx.message_type().to_string()));
    }

    for handler in &handlers {
        handler.handle(ctx)?;
    }
    debug!(
        message_type = ctx.message_type(),
        message_id = ctx.message_id(),
        handlers = handlers.len(),
        "message dispatched"
    );
    Ok(handlers.len())
}
