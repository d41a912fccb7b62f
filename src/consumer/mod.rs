//! Inbound side of the bus.
//!
//! A [`Consumer`] owns one or more delivery flows on a queue. Each flow is a
//! background thread that listens on the transport and runs the per-message
//! algorithm:
//!
//! 1. Dispatch to the `on_message` callback (decoding happens there).
//! 2. Success: ack, then mirror to the audit queue when auditing is enabled.
//! 3. Retryable failure below `max_retries`: schedule a redelivery with an
//!    incremented `x-retry-count` and ack the original.
//! 4. Anything else: copy to the error queue with failure headers, ack the
//!    original, report through the error callback.
//!
//! ## Example
//!
//! ```ignore
//! let consumer = Consumer::new(transport, settings);
//! consumer.start_consuming(on_message, ConsumeOptions::default())?;
//! // ... deliveries are handled on background threads ...
//! let stats = consumer.stop_consuming();
//! println!("handled {} messages", stats.handled);
//! ```

mod flow;
mod retry;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::{BusError, FailureKind, TransportError};
use crate::message::TransportMessage;
use crate::settings::TransportSettings;
use crate::transport::Transport;

use flow::{Flow, Gate};
use retry::RetryScheduler;

pub use retry::RetryStats;

/// Callback run for every delivered message.
pub type OnMessage = Arc<dyn Fn(&TransportMessage) -> Result<(), BusError> + Send + Sync>;

/// Callback run for every message routed to the error queue.
pub type ErrorCallback = Arc<dyn Fn(&ErrorReport) + Send + Sync>;

/// What the error callback learns about a dead-lettered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub message_id: String,
    pub message_type: String,
    pub correlation_id: String,
    pub queue: String,
    pub kind: FailureKind,
    pub reason: String,
    pub retry_count: u32,
}

/// Statistics from a consumer run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsumerStats {
    pub handled: usize,
    pub failed: usize,
    pub retried: usize,
    pub redelivered: usize,
    pub dead_lettered: usize,
    pub audited: usize,
    pub skipped: usize,
    pub polls: usize,
}

impl ConsumerStats {
    fn merge(&mut self, other: &ConsumerStats) {
        self.handled += other.handled;
        self.failed += other.failed;
        self.retried += other.retried;
        self.redelivered += other.redelivered;
        self.dead_lettered += other.dead_lettered;
        self.audited += other.audited;
        self.skipped += other.skipped;
        self.polls += other.polls;
    }
}

/// Per-registration overrides for [`Consumer::start_consuming`].
/// Unset fields fall back to the transport settings.
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    pub routing_key: Option<String>,
    pub queue_name: Option<String>,
    pub exclusive: Option<bool>,
    pub auto_delete: Option<bool>,
}

impl ConsumeOptions {
    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = Some(exclusive);
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = Some(auto_delete);
        self
    }
}

struct Running {
    queue: String,
    flows: Vec<(Sender<()>, JoinHandle<ConsumerStats>)>,
    retries: RetryScheduler,
    gate: Arc<Gate>,
}

/// Consumes a queue with a bounded number of delivery flows.
pub struct Consumer<T: Transport> {
    transport: Arc<T>,
    settings: Arc<TransportSettings>,
    message_types: Vec<String>,
    on_error: Option<ErrorCallback>,
    purged: AtomicBool,
    disposed: AtomicBool,
    running: Mutex<Option<Running>>,
}

impl<T: Transport> Consumer<T> {
    pub fn new(transport: Arc<T>, settings: Arc<TransportSettings>) -> Self {
        Self {
            transport,
            settings,
            message_types: Vec::new(),
            on_error: None,
            purged: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            running: Mutex::new(None),
        }
    }

    /// Only deliver messages of the named types to this registration.
    /// Others are acked and skipped. With no types, everything is delivered.
    pub fn consume_message_type(&mut self, message_type: impl Into<String>) -> &mut Self {
        self.message_types.push(message_type.into());
        self
    }

    pub fn on_error(&mut self, callback: ErrorCallback) -> &mut Self {
        self.on_error = Some(callback);
        self
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    pub fn is_consuming(&self) -> bool {
        self.running
            .lock()
            .map(|running| running.is_some())
            .unwrap_or(false)
    }

    /// Declare and bind the queue, purge it if configured (first start only),
    /// then spawn the delivery flows. Returns once they are running.
    pub fn start_consuming(
        &self,
        on_message: OnMessage,
        options: ConsumeOptions,
    ) -> Result<(), BusError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(BusError::Disposed);
        }
        let mut running = self
            .running
            .lock()
            .map_err(|_| TransportError::LockPoisoned("start_consuming"))?;
        if running.is_some() {
            return Err(BusError::Configuration("consumer is already consuming".into()));
        }

        let queue = options
            .queue_name
            .unwrap_or_else(|| self.settings.queue_name.clone());
        let mut queue_options = self.settings.queue_options();
        if let Some(exclusive) = options.exclusive {
            queue_options.exclusive = exclusive;
        }
        if let Some(auto_delete) = options.auto_delete {
            queue_options.auto_delete = auto_delete;
        }
        self.transport.declare_queue(&queue, &queue_options)?;

        if let Some(routing_key) = options
            .routing_key
            .as_deref()
            .or(self.settings.routing_key.as_deref())
        {
            self.transport.bind(&queue, routing_key)?;
        }

        if self.settings.purge_queue_on_startup && !self.purged.swap(true, Ordering::SeqCst) {
            let purged = self.transport.purge(&queue)?;
            info!(queue = %queue, purged, "purged queue on startup");
        }

        let retries = RetryScheduler::spawn(Arc::clone(&self.transport))?;
        let gate = Arc::new(Gate::new());
        let message_types = Arc::new(self.message_types.clone());

        let mut flows = Vec::with_capacity(self.settings.concurrency);
        for index in 0..self.settings.concurrency {
            let (stop_tx, stop_rx) = channel();
            let flow = Flow {
                transport: Arc::clone(&self.transport),
                settings: Arc::clone(&self.settings),
                queue: queue.clone(),
                message_types: Arc::clone(&message_types),
                on_message: Arc::clone(&on_message),
                on_error: self.on_error.clone(),
                retries: retries.handle(),
                gate: Arc::clone(&gate),
            };
            match flow.spawn(index, stop_rx) {
                Ok(handle) => flows.push((stop_tx, handle)),
                Err(err) => {
                    gate.close();
                    for (stop_tx, handle) in flows {
                        let _ = stop_tx.send(());
                        let _ = handle.join();
                    }
                    retries.stop();
                    return Err(err);
                }
            }
        }

        info!(
            queue = %queue,
            flows = self.settings.concurrency,
            "consumer started"
        );
        *running = Some(Running {
            queue,
            flows,
            retries,
            gate,
        });
        Ok(())
    }

    /// Stop the delivery flows, waiting for in-progress handlers to finish.
    /// Idempotent; returns the statistics of the run that was stopped.
    pub fn stop_consuming(&self) -> ConsumerStats {
        let Some(running) = self.take_running() else {
            return ConsumerStats::default();
        };

        for (stop_tx, _) in &running.flows {
            let _ = stop_tx.send(());
        }
        let mut stats = ConsumerStats::default();
        for (_, handle) in running.flows {
            stats.merge(&handle.join().unwrap_or_default());
        }
        running.gate.close();
        stats.redelivered += running.retries.stop().redelivered;

        info!(queue = %running.queue, handled = stats.handled, "consumer stopped");
        stats
    }

    /// Stop accepting deliveries and give in-progress handlers up to `grace`
    /// to finish. Flows still busy after that are abandoned; they start no
    /// further handler invocations. Idempotent.
    pub fn dispose(&self, grace: Duration) -> ConsumerStats {
        self.disposed.store(true, Ordering::SeqCst);
        let Some(running) = self.take_running() else {
            return ConsumerStats::default();
        };

        running.gate.close();
        for (stop_tx, _) in &running.flows {
            let _ = stop_tx.send(());
        }

        // A grace too long to represent waits for the handlers without limit.
        let deadline = Instant::now().checked_add(grace);
        if !running.gate.wait_idle(deadline) {
            warn!(
                queue = %running.queue,
                grace_ms = grace.as_millis() as u64,
                "handlers still running after shutdown grace period; abandoning"
            );
        }

        let exited = running.gate.wait_flows_exited(deadline);
        let mut stats = ConsumerStats::default();
        for (_, handle) in running.flows {
            if exited || handle.is_finished() {
                stats.merge(&handle.join().unwrap_or_default());
            }
        }
        stats.redelivered += running.retries.stop().redelivered;

        info!(queue = %running.queue, "consumer disposed");
        stats
    }

    fn take_running(&self) -> Option<Running> {
        match self.running.lock() {
            Ok(mut running) => running.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl<T: Transport> Drop for Consumer<T> {
    fn drop(&mut self) {
        if let Some(running) = self.take_running() {
            running.gate.close();
            for (stop_tx, _) in &running.flows {
                let _ = stop_tx.send(());
            }
        }
    }
}
