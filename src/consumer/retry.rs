//! Deferred redelivery.
//!
//! Failed deliveries are not slept on inside a delivery flow. The flow hands
//! a copy with an incremented retry counter to the scheduler, acks the
//! original and moves on; the scheduler thread sends the copy back to the
//! source queue once its delay has elapsed.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{BusError, TransportError};
use crate::message::TransportMessage;
use crate::transport::Transport;

/// Delay before a send that failed on a dropped connection is attempted again.
const RESEND_BACKOFF: Duration = Duration::from_millis(100);

/// Statistics from the retry scheduler.
#[derive(Debug, Default, Clone)]
pub struct RetryStats {
    pub redelivered: usize,
    pub failed: usize,
}

struct Scheduled {
    /// `None` when the delay does not fit in an `Instant`; such entries are
    /// only sent by the flush on stop.
    due: Option<Instant>,
    seq: u64,
    queue: String,
    message: TransportMessage,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed so the max-heap yields the earliest due entry first.
    fn cmp(&self, other: &Self) -> Ordering {
        let due = match (self.due, other.due) {
            (Some(a), Some(b)) => b.cmp(&a),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        };
        due.then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Pending {
    heap: BinaryHeap<Scheduled>,
    seq: u64,
    stopping: bool,
}

struct Shared {
    pending: Mutex<Pending>,
    wake: Condvar,
}

/// Cloneable handle used by delivery flows to schedule redeliveries.
#[derive(Clone)]
pub(crate) struct RetryHandle {
    shared: Arc<Shared>,
}

impl RetryHandle {
    pub(crate) fn schedule(
        &self,
        queue: &str,
        message: TransportMessage,
        delay: Duration,
    ) -> Result<(), BusError> {
        let mut pending = self
            .shared
            .pending
            .lock()
            .map_err(|_| TransportError::LockPoisoned("retry schedule"))?;
        if pending.stopping {
            return Err(BusError::Disposed);
        }
        pending.seq += 1;
        let seq = pending.seq;
        pending.heap.push(Scheduled {
            due: Instant::now().checked_add(delay),
            seq,
            queue: queue.to_string(),
            message,
        });
        drop(pending);
        self.shared.wake.notify_one();
        Ok(())
    }
}

/// Background thread that sends scheduled redeliveries when they fall due.
///
/// On stop, everything still pending is sent immediately so no retry is lost.
pub(crate) struct RetryScheduler {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<RetryStats>>,
}

impl RetryScheduler {
    pub(crate) fn spawn<T: Transport>(transport: Arc<T>) -> Result<Self, BusError> {
        let shared = Arc::new(Shared {
            pending: Mutex::new(Pending::default()),
            wake: Condvar::new(),
        });
        let worker = Arc::clone(&shared);

        let handle = thread::Builder::new()
            .name("bus-retry-scheduler".into())
            .spawn(move || run(&worker, transport.as_ref()))
            .map_err(|e| TransportError::Other(format!("failed to spawn retry scheduler: {}", e)))?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    pub(crate) fn handle(&self) -> RetryHandle {
        RetryHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Flush pending redeliveries and wait for the thread to finish.
    pub(crate) fn stop(mut self) -> RetryStats {
        self.signal_stop();
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_default(),
            None => RetryStats::default(),
        }
    }

    fn signal_stop(&self) {
        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.stopping = true;
        }
        self.shared.wake.notify_all();
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        self.signal_stop();
    }
}

fn run<T: Transport>(shared: &Shared, transport: &T) -> RetryStats {
    let mut stats = RetryStats::default();

    loop {
        let Ok(mut pending) = shared.pending.lock() else {
            warn!("retry scheduler lock poisoned; stopping");
            return stats;
        };

        let now = Instant::now();
        let due = match pending.heap.peek() {
            Some(next) if pending.stopping || next.due.is_some_and(|due| due <= now) => {
                pending.heap.pop()
            }
            Some(Scheduled { due: Some(due), .. }) => {
                let wait = *due - now;
                drop(shared.wake.wait_timeout(pending, wait));
                continue;
            }
            Some(_) => {
                drop(shared.wake.wait(pending));
                continue;
            }
            None if pending.stopping => return stats,
            None => {
                drop(shared.wake.wait(pending));
                continue;
            }
        };
        let stopping = pending.stopping;
        drop(pending);

        let Some(entry) = due else { continue };
        let retry_count = entry.message.retry_count();
        let message_id = entry.message.id().to_string();

        match transport.send(&entry.queue, entry.message.clone()) {
            Ok(()) => {
                stats.redelivered += 1;
                debug!(
                    queue = %entry.queue,
                    message_id = %message_id,
                    retry_count,
                    "redelivered message"
                );
            }
            Err(TransportError::ConnectionLost(reason)) if !stopping => {
                warn!(
                    queue = %entry.queue,
                    message_id = %message_id,
                    %reason,
                    "redelivery failed on lost connection; rescheduling"
                );
                if let Ok(mut pending) = shared.pending.lock() {
                    pending.seq += 1;
                    let seq = pending.seq;
                    pending.heap.push(Scheduled {
                        due: Instant::now().checked_add(RESEND_BACKOFF),
                        seq,
                        ..entry
                    });
                }
            }
            Err(err) => {
                stats.failed += 1;
                warn!(
                    queue = %entry.queue,
                    message_id = %message_id,
                    error = %err,
                    "redelivery failed; message dropped"
                );
            }
        }
    }
}
