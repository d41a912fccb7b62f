//! Delivery flows: the threads that pull from a queue and run the
//! per-message algorithm (dispatch, ack, retry, dead-letter, audit).

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, error, warn};

use super::retry::RetryHandle;
use super::{ConsumerStats, ErrorCallback, ErrorReport, OnMessage};
use crate::error::{BusError, TransportError};
use crate::message::headers;
use crate::settings::TransportSettings;
use crate::transport::{Delivery, Transport};

/// Admission gate for handler invocations.
///
/// Closing the gate guarantees that no invocation starts afterwards. The
/// in-flight and live-flow counts tell disposal how long to wait; both are
/// signalled through one condition variable.
pub(crate) struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
}

#[derive(Default)]
struct GateState {
    closed: bool,
    in_flight: usize,
    flows: usize,
}

pub(crate) struct Admission<'a> {
    gate: &'a Gate,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        self.gate.update(|state| state.in_flight -= 1);
    }
}

/// Held by a delivery flow thread for as long as it runs.
pub(crate) struct FlowLease {
    gate: Arc<Gate>,
}

impl Drop for FlowLease {
    fn drop(&mut self) {
        self.gate.update(|state| state.flows -= 1);
    }
}

impl Gate {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            changed: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut GateState)) {
        f(&mut self.state());
        self.changed.notify_all();
    }

    fn enter(&self) -> Option<Admission<'_>> {
        let mut state = self.state();
        if state.closed {
            return None;
        }
        state.in_flight += 1;
        Some(Admission { gate: self })
    }

    pub(crate) fn lease(self: &Arc<Self>) -> FlowLease {
        self.update(|state| state.flows += 1);
        FlowLease {
            gate: Arc::clone(self),
        }
    }

    pub(crate) fn close(&self) {
        self.update(|state| state.closed = true);
    }

    /// Wait until no invocation is running. `None` waits without limit.
    /// Returns false if the deadline passed first.
    pub(crate) fn wait_idle(&self, deadline: Option<Instant>) -> bool {
        self.wait_for(deadline, |state| state.in_flight == 0)
    }

    /// Wait until every delivery flow thread has exited.
    pub(crate) fn wait_flows_exited(&self, deadline: Option<Instant>) -> bool {
        self.wait_for(deadline, |state| state.flows == 0)
    }

    fn wait_for(&self, deadline: Option<Instant>, done: impl Fn(&GateState) -> bool) -> bool {
        let state = self.state();
        match deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                let (state, _) = self
                    .changed
                    .wait_timeout_while(state, left, |state| !done(state))
                    .unwrap_or_else(PoisonError::into_inner);
                done(&state)
            }
            None => {
                let state = self
                    .changed
                    .wait_while(state, |state| !done(state))
                    .unwrap_or_else(PoisonError::into_inner);
                done(&state)
            }
        }
    }
}

#[derive(PartialEq, Eq)]
enum Next {
    Continue,
    Stop,
}

/// Everything one delivery flow needs.
pub(crate) struct Flow<T: Transport> {
    pub(crate) transport: Arc<T>,
    pub(crate) settings: Arc<TransportSettings>,
    pub(crate) queue: String,
    pub(crate) message_types: Arc<Vec<String>>,
    pub(crate) on_message: OnMessage,
    pub(crate) on_error: Option<ErrorCallback>,
    pub(crate) retries: RetryHandle,
    pub(crate) gate: Arc<Gate>,
}

impl<T: Transport> Flow<T> {
    pub(crate) fn spawn(
        self,
        index: usize,
        stop_rx: Receiver<()>,
    ) -> Result<JoinHandle<ConsumerStats>, BusError> {
        let name = format!("{}-flow-{}", self.queue, index);
        let lease = self.gate.lease();
        thread::Builder::new()
            .name(name)
            .spawn(move || {
                let _lease = lease;
                self.run(stop_rx)
            })
            .map_err(|e| {
                BusError::Transport(TransportError::Other(format!(
                    "failed to spawn delivery flow: {}",
                    e
                )))
            })
    }

    fn run(self, stop_rx: Receiver<()>) -> ConsumerStats {
        let mut stats = ConsumerStats::default();
        let mut backoff = self.settings.reconnect_initial_backoff;

        loop {
            match stop_rx.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            stats.polls += 1;

            let delivery = match self.transport.listen(&self.queue, self.settings.poll_interval) {
                Ok(Some(delivery)) => {
                    backoff = self.settings.reconnect_initial_backoff;
                    delivery
                }
                Ok(None) => continue,
                Err(TransportError::ConnectionLost(reason)) => {
                    warn!(
                        queue = %self.queue,
                        %reason,
                        backoff_ms = backoff.as_millis() as u64,
                        "connection lost; reconnecting"
                    );
                    match stop_rx.recv_timeout(backoff) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    backoff = backoff.saturating_mul(2).min(self.settings.reconnect_max_backoff);
                    if let Err(err) = self.transport.reconnect() {
                        warn!(queue = %self.queue, error = %err, "reconnect attempt failed");
                    }
                    continue;
                }
                Err(TransportError::Closed) => {
                    debug!(queue = %self.queue, "transport closed; delivery flow exiting");
                    break;
                }
                Err(err) => {
                    error!(queue = %self.queue, error = %err, "listen failed");
                    thread::sleep(self.settings.poll_interval);
                    continue;
                }
            };

            if self.process(delivery, &mut stats) == Next::Stop {
                break;
            }
        }

        stats
    }

    fn process(&self, delivery: Delivery, stats: &mut ConsumerStats) -> Next {
        let message = &delivery.message;

        if !self.message_types.is_empty()
            && !self.message_types.iter().any(|t| t == message.message_type())
        {
            debug!(
                queue = %self.queue,
                message_id = message.id(),
                message_type = message.message_type(),
                "no registration for message type; skipping"
            );
            self.ack(&delivery);
            stats.skipped += 1;
            return Next::Continue;
        }

        let Some(_admission) = self.gate.enter() else {
            self.nack(&delivery, true);
            return Next::Stop;
        };

        if self.settings.no_ack {
            self.ack(&delivery);
        }

        debug!(
            queue = %self.queue,
            message_id = message.id(),
            message_type = message.message_type(),
            retry_count = message.retry_count(),
            redelivered = delivery.redelivered,
            "dispatching message"
        );

        match self.invoke(&delivery) {
            Ok(()) => {
                if !self.settings.no_ack {
                    self.ack(&delivery);
                }
                stats.handled += 1;
                self.audit(&delivery, stats);
            }
            Err(err) => {
                stats.failed += 1;
                self.handle_failure(&delivery, err, stats);
            }
        }
        Next::Continue
    }

    fn invoke(&self, delivery: &Delivery) -> Result<(), BusError> {
        let on_message = &self.on_message;
        match panic::catch_unwind(AssertUnwindSafe(|| on_message(&delivery.message))) {
            Ok(result) => result,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(BusError::HandlerFailed {
                    message_type: delivery.message.message_type().to_string(),
                    reason: format!("handler panicked: {}", reason),
                })
            }
        }
    }

    fn handle_failure(&self, delivery: &Delivery, err: BusError, stats: &mut ConsumerStats) {
        let message = &delivery.message;
        let retry_count = message.retry_count();
        let kind = err.kind();

        let can_retry = !self.settings.no_ack
            && kind.is_retryable()
            && retry_count < self.settings.max_retries;
        if !can_retry {
            self.dead_letter(delivery, &err, stats);
            return;
        }

        let mut retry = message.clone();
        retry.set_header(headers::RETRY_COUNT, (retry_count + 1).to_string());
        match self
            .retries
            .schedule(&self.queue, retry, self.settings.retry_delay)
        {
            Ok(()) => {
                self.ack(delivery);
                stats.retried += 1;
                warn!(
                    queue = %self.queue,
                    message_id = message.id(),
                    message_type = message.message_type(),
                    retry_count = retry_count + 1,
                    error = %err,
                    "handler failed; redelivery scheduled"
                );
            }
            Err(schedule_err) => {
                warn!(
                    queue = %self.queue,
                    message_id = message.id(),
                    error = %schedule_err,
                    "could not schedule redelivery; requeueing"
                );
                self.nack(delivery, true);
            }
        }
    }

    fn dead_letter(&self, delivery: &Delivery, err: &BusError, stats: &mut ConsumerStats) {
        let message = &delivery.message;
        let retry_count = message.retry_count();
        let kind = err.kind();
        let reason = err.to_string();

        let copy = message
            .clone()
            .with_header(headers::FAILURE_KIND, kind.as_str())
            .with_header(headers::FAILURE_REASON, reason.clone())
            .with_header(headers::SOURCE_QUEUE, self.queue.clone())
            .with_header(headers::RETRY_COUNT, retry_count.to_string());

        if let Err(send_err) = self.transport.send(&self.settings.error_queue, copy) {
            error!(
                queue = %self.queue,
                error_queue = %self.settings.error_queue,
                message_id = message.id(),
                error = %send_err,
                "failed to route message to error queue; redelivering after retry delay"
            );
            if self.settings.no_ack {
                return;
            }
            // Held back for the retry delay so an unavailable error queue
            // cannot turn one poison message into a busy loop.
            match self
                .retries
                .schedule(&self.queue, message.clone(), self.settings.retry_delay)
            {
                Ok(()) => self.ack(delivery),
                Err(_) => self.nack(delivery, true),
            }
            return;
        }

        if !self.settings.no_ack {
            self.ack(delivery);
        }
        stats.dead_lettered += 1;
        error!(
            queue = %self.queue,
            error_queue = %self.settings.error_queue,
            message_id = message.id(),
            message_type = message.message_type(),
            retry_count,
            failure_kind = kind.as_str(),
            %reason,
            "message routed to error queue"
        );

        if let Some(on_error) = &self.on_error {
            let report = ErrorReport {
                message_id: message.id().to_string(),
                message_type: message.message_type().to_string(),
                correlation_id: message.correlation_id().to_string(),
                queue: self.queue.clone(),
                kind,
                reason,
                retry_count,
            };
            if panic::catch_unwind(AssertUnwindSafe(|| on_error(&report))).is_err() {
                warn!(message_id = %report.message_id, "error callback panicked");
            }
        }
    }

    fn audit(&self, delivery: &Delivery, stats: &mut ConsumerStats) {
        if !self.settings.auditing_enabled {
            return;
        }
        let copy = delivery
            .message
            .clone()
            .with_header(headers::SOURCE_QUEUE, self.queue.clone());
        match self.transport.send(&self.settings.audit_queue, copy) {
            Ok(()) => stats.audited += 1,
            Err(err) => warn!(
                audit_queue = %self.settings.audit_queue,
                message_id = delivery.message.id(),
                error = %err,
                "failed to mirror message to audit queue"
            ),
        }
    }

    fn ack(&self, delivery: &Delivery) {
        if let Err(err) = self.transport.ack(delivery) {
            warn!(queue = %self.queue, tag = delivery.tag, error = %err, "ack failed");
        }
    }

    fn nack(&self, delivery: &Delivery, requeue: bool) {
        if let Err(err) = self.transport.nack(delivery, requeue) {
            warn!(queue = %self.queue, tag = delivery.tag, error = %err, "nack failed");
        }
    }
}
