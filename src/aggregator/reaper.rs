//! Background sweeping of expired aggregator sessions.

use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use super::{Aggregator, AggregatorPersistor, AggregatorProcessor};
use crate::error::{BusError, TransportError};
use crate::lock::LockManager;
use crate::message::Message;
use crate::serializer::Serializer;

/// Statistics from a reaper thread.
#[derive(Debug, Default, Clone)]
pub struct ReaperStats {
    pub sweeps: usize,
    pub reaped: usize,
    pub errors: usize,
}

/// A background thread that runs a sweep every `interval` until stopped.
///
/// ```ignore
/// let reaper = AggregatorReaper::for_aggregator(processor, aggregator, Duration::from_secs(1))?;
/// // ...
/// let stats = reaper.stop();
/// ```
pub struct AggregatorReaper {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<ReaperStats>>,
}

impl AggregatorReaper {
    /// Spawn a reaper for one aggregator registered with `processor`.
    pub fn for_aggregator<M, S, A, P, L>(
        processor: Arc<AggregatorProcessor<P, L>>,
        aggregator: Arc<A>,
        interval: Duration,
    ) -> Result<Self, BusError>
    where
        M: Message,
        S: Serializer,
        A: Aggregator<M, S>,
        P: AggregatorPersistor,
        L: LockManager + Send + Sync + 'static,
    {
        Self::spawn(M::type_name(), interval, move || {
            processor.sweep_expired::<M, S, A>(&*aggregator)
        })
    }

    /// Spawn a reaper around an arbitrary sweep. The sweep returns how many
    /// sessions it reaped.
    pub fn spawn<F>(name: &str, interval: Duration, mut sweep: F) -> Result<Self, BusError>
    where
        F: FnMut() -> Result<usize, BusError> + Send + 'static,
    {
        let (stop_tx, stop_rx) = channel();
        let name = name.to_string();

        let handle = thread::Builder::new()
            .name(format!("bus-reaper-{}", name))
            .spawn(move || {
                let mut stats = ReaperStats::default();
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }

                    stats.sweeps += 1;
                    match sweep() {
                        Ok(0) => {}
                        Ok(reaped) => {
                            debug!(aggregator = %name, reaped, "sweep reaped sessions");
                            stats.reaped += reaped;
                        }
                        Err(err) => {
                            warn!(aggregator = %name, error = %err, "aggregator sweep failed");
                            stats.errors += 1;
                        }
                    }
                }
                stats
            })
            .map_err(|e| TransportError::Other(format!("failed to spawn reaper: {}", e)))?;

        Ok(Self {
            stop_tx,
            handle: Some(handle),
        })
    }

    /// Stop the thread and return its statistics.
    pub fn stop(mut self) -> ReaperStats {
        let _ = self.stop_tx.send(());
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_default(),
            None => ReaperStats::default(),
        }
    }
}

impl Drop for AggregatorReaper {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}
