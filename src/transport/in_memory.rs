//! In-memory transport for testing and single-process scenarios.
//!
//! Queues are created on first use. Published messages are copied into every
//! bound queue. Unacknowledged deliveries are tracked per queue so `nack`
//! and a simulated connection drop can put them back.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{Delivery, QueueOptions, Transport, DEFAULT_MAX_MESSAGE_SIZE};
use crate::error::TransportError;
use crate::message::TransportMessage;

#[derive(Default)]
struct QueueState {
    ready: VecDeque<(TransportMessage, bool)>,
    unacked: HashMap<u64, TransportMessage>,
    options: QueueOptions,
}

struct State {
    queues: HashMap<String, QueueState>,
    bindings: HashMap<String, Vec<String>>,
    acked: Vec<String>,
    next_tag: u64,
    connected: bool,
    closed: bool,
}

impl State {
    fn queue(&mut self, name: &str) -> &mut QueueState {
        self.queues.entry(name.to_string()).or_default()
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if !self.connected {
            return Err(TransportError::ConnectionLost("in-memory transport disconnected".into()));
        }
        Ok(())
    }
}

struct Shared {
    state: Mutex<State>,
    changed: Condvar,
    max_message_size: usize,
}

/// Thread-safe in-memory [`Transport`].
///
/// Cloning yields another handle to the same queues, so a test can keep one
/// handle for inspection while the bus owns another.
///
/// ```
/// use sourced_bus::transport::{InMemoryTransport, Transport};
/// use sourced_bus::TransportMessage;
/// use std::time::Duration;
///
/// let transport = InMemoryTransport::new();
/// transport
///     .send("orders", TransportMessage::with_string_payload("m-1", "OrderPlaced", "{}"))
///     .unwrap();
///
/// let delivery = transport.listen("orders", Duration::from_millis(10)).unwrap().unwrap();
/// assert_eq!(delivery.message.message_type(), "OrderPlaced");
/// transport.ack(&delivery).unwrap();
/// assert_eq!(transport.acknowledged(), vec!["m-1".to_string()]);
/// ```
#[derive(Clone)]
pub struct InMemoryTransport {
    shared: Arc<Shared>,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Create a transport that reports the given payload ceiling.
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queues: HashMap::new(),
                    bindings: HashMap::new(),
                    acked: Vec::new(),
                    next_tag: 1,
                    connected: true,
                    closed: false,
                }),
                changed: Condvar::new(),
                max_message_size,
            }),
        }
    }

    fn state(&self, op: &'static str) -> Result<MutexGuard<'_, State>, TransportError> {
        self.shared
            .state
            .lock()
            .map_err(|_| TransportError::LockPoisoned(op))
    }

    /// Messages currently waiting on `queue`, oldest first.
    pub fn messages(&self, queue: &str) -> Vec<TransportMessage> {
        self.state("messages")
            .map(|state| {
                state
                    .queues
                    .get(queue)
                    .map(|q| q.ready.iter().map(|(m, _)| m.clone()).collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Number of messages waiting on `queue`.
    pub fn len(&self, queue: &str) -> usize {
        self.state("len")
            .map(|state| state.queues.get(queue).map_or(0, |q| q.ready.len()))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    /// Deliveries handed out on `queue` and not yet acked or nacked.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state("unacked_count")
            .map(|state| state.queues.get(queue).map_or(0, |q| q.unacked.len()))
            .unwrap_or(0)
    }

    /// Ids of acknowledged messages, in ack order.
    pub fn acknowledged(&self) -> Vec<String> {
        self.state("acknowledged")
            .map(|state| state.acked.clone())
            .unwrap_or_default()
    }

    /// Find a waiting message on `queue` by type.
    pub fn find_by_type(&self, queue: &str, message_type: &str) -> Option<TransportMessage> {
        self.messages(queue)
            .into_iter()
            .find(|m| m.message_type() == message_type)
    }

    /// Options the queue was declared with, if it was declared.
    pub fn queue_options(&self, queue: &str) -> Option<QueueOptions> {
        self.state("queue_options")
            .ok()
            .and_then(|state| state.queues.get(queue).map(|q| q.options.clone()))
    }

    /// Block until `queue` holds at least `count` waiting messages.
    /// Returns false on timeout.
    pub fn wait_for_len(&self, queue: &str, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let Ok(mut state) = self.state("wait_for_len") else {
            return false;
        };
        loop {
            if state.queues.get(queue).map_or(0, |q| q.ready.len()) >= count {
                return true;
            }
            let waited = match remaining(deadline) {
                Some(Duration::ZERO) => return false,
                Some(left) => self
                    .shared
                    .changed
                    .wait_timeout(state, left)
                    .ok()
                    .map(|(guard, _)| guard),
                None => self.shared.changed.wait(state).ok(),
            };
            state = match waited {
                Some(guard) => guard,
                None => return false,
            };
        }
    }

    /// Simulate a dropped broker connection.
    ///
    /// Unacked deliveries return to the front of their queues flagged as
    /// redelivered, and every operation fails with `ConnectionLost` until
    /// [`Transport::reconnect`] is called.
    pub fn disconnect(&self) {
        if let Ok(mut state) = self.state("disconnect") {
            state.connected = false;
            for queue in state.queues.values_mut() {
                let mut tags: Vec<u64> = queue.unacked.keys().copied().collect();
                tags.sort_unstable_by(|a, b| b.cmp(a));
                for tag in tags {
                    if let Some(message) = queue.unacked.remove(&tag) {
                        queue.ready.push_front((message, true));
                    }
                }
            }
        }
        self.shared.changed.notify_all();
    }

    pub fn is_connected(&self) -> bool {
        self.state("is_connected")
            .map(|state| state.connected && !state.closed)
            .unwrap_or(false)
    }
}

/// Time left until `deadline`, zero once it has passed. `None` means no
/// deadline.
fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
}

impl Transport for InMemoryTransport {
    fn declare_queue(&self, queue: &str, options: &QueueOptions) -> Result<(), TransportError> {
        let mut state = self.state("declare_queue")?;
        state.check_open()?;
        state.queue(queue).options = options.clone();
        Ok(())
    }

    fn send(&self, queue: &str, message: TransportMessage) -> Result<(), TransportError> {
        {
            let mut state = self.state("send")?;
            state.check_open()?;
            state.queue(queue).ready.push_back((message, false));
        }
        self.shared.changed.notify_all();
        Ok(())
    }

    fn publish(&self, topic: &str, message: TransportMessage) -> Result<usize, TransportError> {
        let delivered = {
            let mut state = self.state("publish")?;
            state.check_open()?;
            let targets = state.bindings.get(topic).cloned().unwrap_or_default();
            for queue in &targets {
                state.queue(queue).ready.push_back((message.clone(), false));
            }
            targets.len()
        };
        if delivered > 0 {
            self.shared.changed.notify_all();
        }
        Ok(delivered)
    }

    fn bind(&self, queue: &str, topic: &str) -> Result<(), TransportError> {
        let mut state = self.state("bind")?;
        state.check_open()?;
        state.queue(queue);
        let bound = state.bindings.entry(topic.to_string()).or_default();
        if !bound.iter().any(|q| q == queue) {
            bound.push(queue.to_string());
        }
        Ok(())
    }

    fn listen(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>, TransportError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state("listen")?;
        loop {
            state.check_open()?;

            let tag = state.next_tag;
            let q = state.queue(queue);
            if let Some((message, redelivered)) = q.ready.pop_front() {
                q.unacked.insert(tag, message.clone());
                state.next_tag += 1;
                return Ok(Some(Delivery {
                    tag,
                    queue: queue.to_string(),
                    message,
                    redelivered,
                }));
            }

            let waited = match remaining(deadline) {
                Some(Duration::ZERO) => return Ok(None),
                Some(left) => self
                    .shared
                    .changed
                    .wait_timeout(state, left)
                    .ok()
                    .map(|(guard, _)| guard),
                None => self.shared.changed.wait(state).ok(),
            };
            state = waited.ok_or(TransportError::LockPoisoned("listen"))?;
        }
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        let mut state = self.state("ack")?;
        state.check_open()?;
        let message = state
            .queue(&delivery.queue)
            .unacked
            .remove(&delivery.tag)
            .ok_or_else(|| TransportError::UnknownDelivery {
                queue: delivery.queue.clone(),
                tag: delivery.tag,
            })?;
        state.acked.push(message.id().to_string());
        drop(state);
        self.shared.changed.notify_all();
        Ok(())
    }

    fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError> {
        let mut state = self.state("nack")?;
        state.check_open()?;
        let q = state.queue(&delivery.queue);
        let message = q
            .unacked
            .remove(&delivery.tag)
            .ok_or_else(|| TransportError::UnknownDelivery {
                queue: delivery.queue.clone(),
                tag: delivery.tag,
            })?;
        if requeue {
            q.ready.push_front((message, true));
        }
        drop(state);
        self.shared.changed.notify_all();
        Ok(())
    }

    fn purge(&self, queue: &str) -> Result<usize, TransportError> {
        let mut state = self.state("purge")?;
        state.check_open()?;
        let q = state.queue(queue);
        let dropped = q.ready.len();
        q.ready.clear();
        Ok(dropped)
    }

    fn max_message_size(&self) -> usize {
        self.shared.max_message_size
    }

    fn reconnect(&self) -> Result<(), TransportError> {
        let mut state = self.state("reconnect")?;
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.connected = true;
        drop(state);
        self.shared.changed.notify_all();
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        let mut state = self.state("close")?;
        state.closed = true;
        drop(state);
        self.shared.changed.notify_all();
        Ok(())
    }
}
