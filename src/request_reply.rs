//! Request/reply correlation.
//!
//! A caller registers its correlation id before sending the request and then
//! blocks on the returned [`PendingReply`]. Delivery flows hand every
//! incoming reply to [`Correlator::resolve`]; a match wakes the caller and
//! the reply never reaches the generic handlers.
//!
//! Each entry resolves exactly once: by its reply, by its deadline, or by
//! [`Correlator::cancel_all`] on disposal. Whatever arrives afterwards is a
//! late reply and is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{BusError, TransportError};
use crate::message::TransportMessage;

struct InFlightRequest {
    reply_tx: SyncSender<Result<TransportMessage, BusError>>,
    /// `None` when the timeout is too large to represent; the caller then
    /// waits until a reply or cancellation.
    deadline: Option<Instant>,
    message_type: String,
}

/// What [`Correlator::resolve`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The reply woke a waiting caller.
    Resolved,
    /// A reply with no waiting caller (timed out, cancelled or duplicate).
    Late,
    /// Not a reply; dispatch it normally.
    NotAReply,
}

/// Registry of outstanding requests keyed by correlation id.
#[derive(Default)]
pub struct Correlator {
    pending: Mutex<HashMap<String, InFlightRequest>>,
    closed: AtomicBool,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> Result<MutexGuard<'_, HashMap<String, InFlightRequest>>, BusError> {
        self.pending
            .lock()
            .map_err(|_| BusError::Transport(TransportError::LockPoisoned("correlator")))
    }

    /// Register a waiter for `correlation_id`. Must be called before the
    /// request is sent so a fast reply cannot be missed.
    pub fn register(
        self: &Arc<Self>,
        correlation_id: impl Into<String>,
        message_type: impl Into<String>,
        timeout: Duration,
    ) -> Result<PendingReply, BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Disposed);
        }
        let correlation_id = correlation_id.into();
        let (reply_tx, reply_rx) = sync_channel(1);
        let deadline = Instant::now().checked_add(timeout);

        let mut pending = self.pending()?;
        if pending.contains_key(&correlation_id) {
            return Err(BusError::InvalidMessage(format!(
                "a request with correlation id {} is already pending",
                correlation_id
            )));
        }
        pending.insert(
            correlation_id.clone(),
            InFlightRequest {
                reply_tx,
                deadline,
                message_type: message_type.into(),
            },
        );

        Ok(PendingReply {
            correlator: Arc::clone(self),
            correlation_id,
            timeout,
            deadline,
            reply_rx,
            done: false,
        })
    }

    /// Offer an incoming message to the waiting callers.
    pub fn resolve(&self, message: &TransportMessage) -> Resolution {
        if !message.is_reply() {
            return Resolution::NotAReply;
        }
        let correlation_id = message.correlation_id();

        let entry = match self.pending() {
            Ok(mut pending) => pending.remove(correlation_id),
            Err(_) => None,
        };

        match entry {
            Some(request) => {
                if request.deadline.is_some_and(|deadline| Instant::now() > deadline) {
                    debug!(
                        correlation_id,
                        request_type = %request.message_type,
                        "reply arrived after the deadline; caller is giving up"
                    );
                }
                // A full or disconnected channel means the caller already
                // stopped waiting.
                let _ = request.reply_tx.try_send(Ok(message.clone()));
                debug!(correlation_id, message_id = message.id(), "reply resolved");
                Resolution::Resolved
            }
            None => {
                warn!(
                    correlation_id,
                    message_id = message.id(),
                    message_type = message.message_type(),
                    "late or unexpected reply dropped"
                );
                Resolution::Late
            }
        }
    }

    /// Resolve every pending request as cancelled and refuse new ones.
    pub fn cancel_all(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<(String, InFlightRequest)> = match self.pending() {
            Ok(mut pending) => pending.drain().collect(),
            Err(_) => Vec::new(),
        };
        let cancelled = drained.len();
        for (correlation_id, request) in drained {
            let _ = request
                .reply_tx
                .try_send(Err(BusError::Cancelled(correlation_id)));
        }
        if cancelled > 0 {
            debug!(cancelled, "cancelled pending requests");
        }
        cancelled
    }

    pub fn pending_count(&self) -> usize {
        self.pending().map(|pending| pending.len()).unwrap_or(0)
    }

    pub fn is_pending(&self, correlation_id: &str) -> bool {
        self.pending()
            .map(|pending| pending.contains_key(correlation_id))
            .unwrap_or(false)
    }

    fn remove(&self, correlation_id: &str) {
        if let Ok(mut pending) = self.pending() {
            pending.remove(correlation_id);
        }
    }
}

/// A registered request waiting for its reply.
///
/// Dropping it without waiting removes the registration.
pub struct PendingReply {
    correlator: Arc<Correlator>,
    correlation_id: String,
    timeout: Duration,
    deadline: Option<Instant>,
    reply_rx: Receiver<Result<TransportMessage, BusError>>,
    done: bool,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Block until the reply arrives, the timeout passes, or the bus is
    /// disposed.
    pub fn wait(mut self) -> Result<TransportMessage, BusError> {
        self.done = true;
        let received = match self.deadline {
            Some(deadline) => self
                .reply_rx
                .recv_timeout(deadline.saturating_duration_since(Instant::now())),
            None => self
                .reply_rx
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                self.correlator.remove(&self.correlation_id);
                // The reply may have landed between the timeout and removal.
                match self.reply_rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(BusError::TimedOut {
                        correlation_id: self.correlation_id.clone(),
                        timeout: self.timeout,
                    }),
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(BusError::Cancelled(self.correlation_id.clone()))
            }
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if !self.done {
            self.correlator.remove(&self.correlation_id);
        }
    }
}
