//! The bus: composition root wiring producer, consumer, correlator,
//! handlers and aggregator reapers together.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::registry::dispatch;
use super::{BusBuilder, Context, HandlerResolver, ReaperFactory};
use crate::aggregator::AggregatorReaper;
use crate::consumer::{ConsumeOptions, Consumer, ConsumerStats, OnMessage};
use crate::error::BusError;
use crate::message::{headers, Envelope, Message, TransportMessage};
use crate::producer::{Outbound, Producer};
use crate::request_reply::{Correlator, Resolution};
use crate::serializer::{JsonSerializer, Serializer};
use crate::settings::TransportSettings;
use crate::transport::Transport;

/// A message bus endpoint for one service.
///
/// The bus owns its settings, routing table and handlers. Sending works as
/// soon as it is built; incoming messages are handled once
/// [`start_consuming`](Bus::start_consuming) is called.
///
/// ## Example
///
/// ```ignore
/// let bus = Bus::builder(TransportSettings::new("orders"), transport)
///     .map::<ChargeCard>("billing")
///     .handler::<OrderPlaced, _>(PlaceOrderHandler)
///     .build()?;
///
/// bus.start_consuming()?;
/// bus.send(ChargeCard { order_id: "o-1".into() })?;
/// let quote: Quote = bus.send_request(GetQuote { sku }, Duration::from_secs(5))?;
/// bus.dispose();
/// ```
pub struct Bus<T: Transport, S: Serializer = JsonSerializer> {
    settings: Arc<TransportSettings>,
    transport: Arc<T>,
    serializer: Arc<S>,
    producer: Arc<Producer<T, S>>,
    consumer: Consumer<T>,
    correlator: Arc<Correlator>,
    resolver: Arc<dyn HandlerResolver<S>>,
    reaper_factories: Vec<ReaperFactory>,
    reapers: Mutex<Vec<AggregatorReaper>>,
    disposed: AtomicBool,
}

impl<T: Transport> Bus<T, JsonSerializer> {
    /// Start building a bus that serializes messages as JSON.
    pub fn builder(settings: TransportSettings, transport: T) -> BusBuilder<T, JsonSerializer> {
        BusBuilder::new(settings, transport)
    }
}

impl<T: Transport, S: Serializer> Bus<T, S> {
    pub(super) fn assemble(
        settings: Arc<TransportSettings>,
        transport: Arc<T>,
        serializer: Arc<S>,
        producer: Arc<Producer<T, S>>,
        consumer: Consumer<T>,
        resolver: Arc<dyn HandlerResolver<S>>,
        reaper_factories: Vec<ReaperFactory>,
    ) -> Self {
        Self {
            settings,
            transport,
            serializer,
            producer,
            consumer,
            correlator: Arc::new(Correlator::new()),
            resolver,
            reaper_factories,
            reapers: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn producer(&self) -> &Producer<T, S> {
        &self.producer
    }

    pub fn is_consuming(&self) -> bool {
        self.consumer.is_consuming()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }

    /// Send to the queues mapped for `M`, or to this bus's own queue.
    pub fn send<M: Message>(&self, envelope: impl Into<Envelope<M>>) -> Result<(), BusError> {
        self.ensure_active()?;
        self.producer.send(envelope)
    }

    pub fn send_to<M: Message>(
        &self,
        queue: &str,
        envelope: impl Into<Envelope<M>>,
    ) -> Result<(), BusError> {
        self.ensure_active()?;
        self.producer.send_to(queue, envelope)
    }

    /// Publish to every queue subscribed to `M`. Returns how many received it.
    pub fn publish<M: Message>(&self, envelope: impl Into<Envelope<M>>) -> Result<usize, BusError> {
        self.ensure_active()?;
        self.producer.publish(envelope)
    }

    /// Send an already serialized message.
    pub fn send_bytes(&self, queue: &str, message: TransportMessage) -> Result<(), BusError> {
        self.ensure_active()?;
        self.producer.send_bytes(queue, message)
    }

    /// Send a request and block until its reply arrives or `timeout` passes.
    ///
    /// The reply is routed back to this bus's queue, so the bus must be
    /// consuming. Only the calling thread blocks.
    pub fn send_request<Req: Message, Resp: Message>(
        &self,
        request: impl Into<Envelope<Req>>,
        timeout: Duration,
    ) -> Result<Resp, BusError> {
        self.ensure_active()?;
        if !self.consumer.is_consuming() {
            return Err(BusError::Configuration(
                "send_request needs the bus to be consuming its queue to receive the reply".into(),
            ));
        }

        let envelope = request.into();
        let correlation_id = envelope.correlation_id().to_string();
        // Registered before sending so a fast reply cannot slip past.
        let pending = self
            .correlator
            .register(correlation_id.clone(), Req::type_name(), timeout)?;

        let mut message = self.producer.encode(&envelope)?;
        message.set_header(headers::REPLY_TO, self.settings.queue_name.clone());
        for queue in self.producer.destinations(Req::type_name()) {
            self.producer.send_message(&queue, message.clone())?;
        }
        debug!(
            correlation_id = %correlation_id,
            message_type = Req::type_name(),
            timeout_ms = timeout.as_millis() as u64,
            "request sent; awaiting reply"
        );

        let reply = pending.wait()?;
        self.serializer
            .deserialize(&reply.payload, reply.message_type())
    }

    /// Subscribe the bus's queue to every handled message type and start
    /// the delivery flows and aggregator reapers. Returns once they run.
    pub fn start_consuming(&self) -> Result<(), BusError> {
        self.ensure_active()?;
        let queue = self.settings.queue_name.clone();

        self.transport
            .declare_queue(&queue, &self.settings.queue_options())?;
        let message_types = self.resolver.message_types();
        for message_type in &message_types {
            self.transport.bind(&queue, message_type)?;
        }

        self.consumer
            .start_consuming(self.on_message(queue.clone()), ConsumeOptions::default())?;
        if let Err(err) = self.start_reapers() {
            self.consumer.stop_consuming();
            return Err(err);
        }

        if let Err(err) = self.producer.send_heartbeat() {
            warn!(queue = %queue, error = %err, "failed to send heartbeat");
        }
        info!(queue = %queue, handled_types = ?message_types, "bus consuming");
        Ok(())
    }

    /// Stop the delivery flows and reapers. Sending keeps working and
    /// consuming can be started again.
    pub fn stop_consuming(&self) -> ConsumerStats {
        let stats = self.consumer.stop_consuming();
        self.stop_reapers();
        stats
    }

    /// Shut the bus down. Idempotent.
    ///
    /// New deliveries stop, in-progress handlers get the configured grace
    /// period, pending requests resolve as cancelled, and the producer and
    /// transport are closed.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let stats = self.consumer.dispose(self.settings.shutdown_grace);
        let cancelled = self.correlator.cancel_all();
        self.stop_reapers();
        self.producer.disconnect();
        if let Err(err) = self.transport.close() {
            warn!(queue = %self.settings.queue_name, error = %err, "failed to close transport");
        }

        info!(
            queue = %self.settings.queue_name,
            handled = stats.handled,
            dead_lettered = stats.dead_lettered,
            cancelled,
            "bus disposed"
        );
    }

    fn ensure_active(&self) -> Result<(), BusError> {
        if self.is_disposed() {
            Err(BusError::Disposed)
        } else {
            Ok(())
        }
    }

    fn on_message(&self, queue: String) -> OnMessage {
        let correlator = Arc::clone(&self.correlator);
        let resolver = Arc::clone(&self.resolver);
        let serializer = Arc::clone(&self.serializer);
        let producer = Arc::clone(&self.producer);

        Arc::new(move |message: &TransportMessage| {
            match correlator.resolve(message) {
                Resolution::NotAReply => {}
                Resolution::Resolved | Resolution::Late => return Ok(()),
            }
            let ctx = Context::new(message, &queue, &*serializer, &*producer);
            dispatch(&*resolver, &ctx).map(|_| ())
        })
    }

    fn start_reapers(&self) -> Result<(), BusError> {
        let mut reapers = self
            .reapers
            .lock()
            .map_err(|_| BusError::Configuration("reaper registry poisoned".into()))?;
        if !reapers.is_empty() {
            return Ok(());
        }
        for factory in &self.reaper_factories {
            match factory() {
                Ok(reaper) => reapers.push(reaper),
                Err(err) => {
                    for reaper in reapers.drain(..) {
                        reaper.stop();
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn stop_reapers(&self) {
        let reapers = match self.reapers.lock() {
            Ok(mut reapers) => std::mem::take(&mut *reapers),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for reaper in reapers {
            let stats = reaper.stop();
            debug!(sweeps = stats.sweeps, reaped = stats.reaped, "aggregator reaper stopped");
        }
    }
}

impl<T: Transport, S: Serializer> Drop for Bus<T, S> {
    fn drop(&mut self) {
        self.dispose();
    }
}
