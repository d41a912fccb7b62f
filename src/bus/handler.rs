//! Handlers and their type-erased form.
//!
//! Application code implements [`Handler`] for a concrete message type (or
//! wraps a closure with [`handle_fn`]). The registry stores handlers as
//! [`MessageHandler`] trait objects that decode the payload themselves.

use std::marker::PhantomData;
use std::sync::Arc;

use tracing::debug;

use super::Context;
use crate::aggregator::{Aggregator, AggregatorPersistor, AggregatorProcessor};
use crate::error::{BusError, HandlerError};
use crate::lock::LockManager;
use crate::message::Message;
use crate::process_manager::{ProcessManager, ProcessManagerRuntime, ProcessManagerStore};
use crate::serializer::{JsonSerializer, Serializer};

/// Handles messages of type `M`.
pub trait Handler<M: Message, S: Serializer = JsonSerializer>: Send + Sync + 'static {
    fn handle(&self, message: M, ctx: &Context<'_, S>) -> Result<(), HandlerError>;
}

/// A [`Handler`] backed by a closure. Built with [`handle_fn`].
pub struct FnHandler<F, M> {
    f: F,
    _message: PhantomData<fn(M)>,
}

/// Wrap a closure as a handler.
///
/// ```ignore
/// builder.handler(handle_fn(|order: OrderPlaced, ctx: &Context| {
///     ctx.publish(OrderAccepted { id: order.id })?;
///     Ok(())
/// }));
/// ```
pub fn handle_fn<F, M, S>(f: F) -> FnHandler<F, M>
where
    M: Message,
    S: Serializer,
    F: Fn(M, &Context<'_, S>) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    FnHandler {
        f,
        _message: PhantomData,
    }
}

impl<F, M, S> Handler<M, S> for FnHandler<F, M>
where
    M: Message,
    S: Serializer,
    F: Fn(M, &Context<'_, S>) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, message: M, ctx: &Context<'_, S>) -> Result<(), HandlerError> {
        (self.f)(message, ctx)
    }
}

/// A handler bound to one message type, as stored by the registry.
pub trait MessageHandler<S: Serializer = JsonSerializer>: Send + Sync {
    fn message_type(&self) -> &'static str;

    fn handle(&self, ctx: &Context<'_, S>) -> Result<(), BusError>;
}

pub(crate) struct TypedHandler<M, H> {
    handler: H,
    _message: PhantomData<fn(M)>,
}

impl<M, H> TypedHandler<M, H> {
    pub(crate) fn new(handler: H) -> Self {
        Self {
            handler,
            _message: PhantomData,
        }
    }
}

impl<M, S, H> MessageHandler<S> for TypedHandler<M, H>
where
    M: Message,
    S: Serializer,
    H: Handler<M, S>,
{
    fn message_type(&self) -> &'static str {
        M::type_name()
    }

    fn handle(&self, ctx: &Context<'_, S>) -> Result<(), BusError> {
        let message = ctx.decode::<M>()?;
        self.handler
            .handle(message, ctx)
            .map_err(|err| BusError::from_handler(M::type_name(), err))
    }
}

pub(crate) struct ProcessManagerHandler<M, P, St, L> {
    manager: Arc<P>,
    runtime: Arc<ProcessManagerRuntime<St, L>>,
    _message: PhantomData<fn(M)>,
}

impl<M, P, St, L> ProcessManagerHandler<M, P, St, L> {
    pub(crate) fn new(manager: Arc<P>, runtime: Arc<ProcessManagerRuntime<St, L>>) -> Self {
        Self {
            manager,
            runtime,
            _message: PhantomData,
        }
    }
}

impl<M, S, P, St, L> MessageHandler<S> for ProcessManagerHandler<M, P, St, L>
where
    M: Message,
    S: Serializer,
    P: ProcessManager<M, S>,
    St: ProcessManagerStore,
    L: LockManager + 'static,
{
    fn message_type(&self) -> &'static str {
        M::type_name()
    }

    fn handle(&self, ctx: &Context<'_, S>) -> Result<(), BusError> {
        let message = ctx.decode::<M>()?;
        let outcome = self.runtime.handle(&*self.manager, &message, ctx)?;
        debug!(
            message_type = M::type_name(),
            message_id = ctx.message_id(),
            ?outcome,
            "process manager applied message"
        );
        Ok(())
    }
}

pub(crate) struct AggregatorHandler<M, A, P, L> {
    aggregator: Arc<A>,
    processor: Arc<AggregatorProcessor<P, L>>,
    _message: PhantomData<fn(M)>,
}

impl<M, A, P, L> AggregatorHandler<M, A, P, L> {
    pub(crate) fn new(aggregator: Arc<A>, processor: Arc<AggregatorProcessor<P, L>>) -> Self {
        Self {
            aggregator,
            processor,
            _message: PhantomData,
        }
    }
}

impl<M, S, A, P, L> MessageHandler<S> for AggregatorHandler<M, A, P, L>
where
    M: Message,
    S: Serializer,
    A: Aggregator<M, S>,
    P: AggregatorPersistor,
    L: LockManager + 'static,
{
    fn message_type(&self) -> &'static str {
        M::type_name()
    }

    fn handle(&self, ctx: &Context<'_, S>) -> Result<(), BusError> {
        let message = ctx.decode::<M>()?;
        let outcome = self
            .processor
            .handle(&*self.aggregator, message, ctx)?;
        debug!(
            message_type = M::type_name(),
            correlation_id = ctx.correlation_id(),
            ?outcome,
            "aggregator accepted part"
        );
        Ok(())
    }
}
