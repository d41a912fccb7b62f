//! Explicit construction of a [`Bus`].

use std::sync::Arc;

use super::handler::{AggregatorHandler, ProcessManagerHandler, TypedHandler};
use super::{handle_fn, Bus, Context, Handler, HandlerRegistry, HandlerResolver, ReaperFactory};
use crate::aggregator::{Aggregator, AggregatorPersistor, AggregatorProcessor, AggregatorReaper};
use crate::consumer::{Consumer, ErrorCallback, ErrorReport};
use crate::error::{BusError, HandlerError};
use crate::lock::{InMemoryLockManager, LockManager};
use crate::message::Message;
use crate::process_manager::{ProcessManager, ProcessManagerRuntime, ProcessManagerStore};
use crate::producer::Producer;
use crate::serializer::{JsonSerializer, Serializer};
use crate::settings::{QueueMappings, TransportSettings};
use crate::transport::Transport;

/// Collects settings, routing and handlers, then builds a [`Bus`].
///
/// ```ignore
/// let bus = Bus::builder(TransportSettings::new("orders"), transport)
///     .map::<ChargeCard>("billing")
///     .handle_fn(|order: OrderPlaced, ctx: &Context| {
///         ctx.send(ChargeCard { order_id: order.id })?;
///         Ok(())
///     })
///     .build()?;
/// bus.start_consuming()?;
/// ```
pub struct BusBuilder<T: Transport, S: Serializer = JsonSerializer> {
    settings: TransportSettings,
    transport: T,
    serializer: S,
    mappings: QueueMappings,
    registry: HandlerRegistry<S>,
    resolver: Option<Arc<dyn HandlerResolver<S>>>,
    on_error: Option<ErrorCallback>,
    reapers: Vec<ReaperFactory>,
}

impl<T: Transport> BusBuilder<T, JsonSerializer> {
    pub fn new(settings: TransportSettings, transport: T) -> Self {
        Self::with_serializer(settings, transport, JsonSerializer)
    }
}

impl<T: Transport, S: Serializer> BusBuilder<T, S> {
    pub fn with_serializer(settings: TransportSettings, transport: T, serializer: S) -> Self {
        Self {
            settings,
            transport,
            serializer,
            mappings: QueueMappings::new(),
            registry: HandlerRegistry::new(),
            resolver: None,
            on_error: None,
            reapers: Vec::new(),
        }
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Replace the routing table.
    pub fn queue_mappings(mut self, mappings: QueueMappings) -> Self {
        self.mappings = mappings;
        self
    }

    /// Route `M` to `queue`. Repeat to fan out to several queues.
    pub fn map<M: Message>(mut self, queue: impl Into<String>) -> Self {
        self.mappings = self.mappings.map::<M>(queue);
        self
    }

    pub fn handler<M: Message, H: Handler<M, S>>(mut self, handler: H) -> Self {
        self.registry
            .register(Arc::new(TypedHandler::<M, H>::new(handler)));
        self
    }

    pub fn handle_fn<M, F>(self, f: F) -> Self
    where
        M: Message,
        F: Fn(M, &Context<'_, S>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.handler::<M, _>(handle_fn::<F, M, S>(f))
    }

    /// A process manager runtime configured from the bus settings.
    pub fn process_manager_runtime<St: ProcessManagerStore>(
        &self,
        store: St,
    ) -> Arc<ProcessManagerRuntime<St>> {
        Arc::new(ProcessManagerRuntime::new(store).with_max_retries(self.settings.max_concurrency_retries))
    }

    /// Route messages of type `M` to a process manager. Register once per
    /// message type the process manager handles.
    pub fn process_manager<M, P, St, L>(
        mut self,
        manager: Arc<P>,
        runtime: Arc<ProcessManagerRuntime<St, L>>,
    ) -> Self
    where
        M: Message,
        P: ProcessManager<M, S>,
        St: ProcessManagerStore,
        L: LockManager + 'static,
    {
        self.registry
            .register(Arc::new(ProcessManagerHandler::<M, P, St, L>::new(manager, runtime)));
        self
    }

    /// Route parts of type `M` to an aggregator with its own processor over
    /// `persistor`, using the timeout and sweep interval from the settings.
    pub fn aggregator<M, A, P>(self, aggregator: A, persistor: P) -> Self
    where
        M: Message,
        A: Aggregator<M, S>,
        P: AggregatorPersistor,
    {
        let processor =
            AggregatorProcessor::new(persistor).with_timeout(self.settings.aggregator_timeout);
        self.aggregator_with_processor::<M, A, P, InMemoryLockManager>(
            Arc::new(aggregator),
            Arc::new(processor),
        )
    }

    pub fn aggregator_with_processor<M, A, P, L>(
        mut self,
        aggregator: Arc<A>,
        processor: Arc<AggregatorProcessor<P, L>>,
    ) -> Self
    where
        M: Message,
        A: Aggregator<M, S>,
        P: AggregatorPersistor,
        L: LockManager + 'static,
    {
        self.registry.register(Arc::new(AggregatorHandler::<M, A, P, L>::new(
            Arc::clone(&aggregator),
            Arc::clone(&processor),
        )));

        let interval = self.settings.aggregator_sweep_interval;
        self.reapers.push(Box::new(move || {
            AggregatorReaper::for_aggregator::<M, S, A, P, L>(
                Arc::clone(&processor),
                Arc::clone(&aggregator),
                interval,
            )
        }));
        self
    }

    /// Resolve handlers through an application resolver instead of the
    /// built-in registry.
    pub fn resolver(mut self, resolver: impl HandlerResolver<S>) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Called for every message routed to the error queue.
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ErrorReport) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Validate the settings and assemble the bus.
    pub fn build(self) -> Result<Bus<T, S>, BusError> {
        self.settings.validate()?;

        let resolver: Arc<dyn HandlerResolver<S>> = match self.resolver {
            Some(_) if !self.registry.is_empty() => {
                return Err(BusError::Configuration(
                    "handlers were registered alongside a custom resolver".into(),
                ))
            }
            Some(resolver) => resolver,
            None => Arc::new(self.registry),
        };

        let settings = Arc::new(self.settings);
        let transport = Arc::new(self.transport);
        let serializer = Arc::new(self.serializer);
        let producer = Arc::new(Producer::new(
            Arc::clone(&transport),
            Arc::clone(&serializer),
            Arc::clone(&settings),
            Arc::new(self.mappings),
        ));

        let mut consumer = Consumer::new(Arc::clone(&transport), Arc::clone(&settings));
        if let Some(callback) = self.on_error {
            consumer.on_error(callback);
        }

        Ok(Bus::assemble(
            settings,
            transport,
            serializer,
            producer,
            consumer,
            resolver,
            self.reapers,
        ))
    }
}
