//! Session bookkeeping for aggregators.

use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

use super::{Aggregator, AggregatorPersistor, AggregatorSession};
use crate::bus::Context;
use crate::error::BusError;
use crate::lock::{lock_key, InMemoryLockManager, LockManager};
use crate::message::Message;
use crate::serializer::Serializer;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// What happened to a part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOutcome {
    /// Appended; the session is still waiting for more parts.
    Pending { received: usize },
    /// The predicate held and the aggregate handler ran.
    Completed { parts: usize },
    /// The part was already in the session.
    Duplicate,
}

/// Appends parts to sessions and completes or reaps them.
///
/// Appends for the same session are serialized with a keyed lock. A session
/// is persisted after every append, so if the aggregate handler fails the
/// parts survive and a redelivery of the last part completes it again.
pub struct AggregatorProcessor<P, L = InMemoryLockManager> {
    persistor: P,
    locks: L,
    timeout: Duration,
}

impl<P: AggregatorPersistor> AggregatorProcessor<P, InMemoryLockManager> {
    pub fn new(persistor: P) -> Self {
        Self::with_lock_manager(persistor, InMemoryLockManager::new())
    }
}

impl<P: AggregatorPersistor, L: LockManager> AggregatorProcessor<P, L> {
    pub fn with_lock_manager(persistor: P, locks: L) -> Self {
        Self {
            persistor,
            locks,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Age after which an incomplete session is reaped.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn persistor(&self) -> &P {
        &self.persistor
    }

    /// Feed a part to `aggregator`. Sessions are named after `M`.
    pub fn handle<M, S, A>(
        &self,
        aggregator: &A,
        message: M,
        ctx: &Context<'_, S>,
    ) -> Result<AggregateOutcome, BusError>
    where
        M: Message,
        S: Serializer,
        A: Aggregator<M, S>,
    {
        let correlation_id = aggregator.correlation_id(&message, ctx);
        self.handle_with(
            M::type_name(),
            &correlation_id,
            ctx.message_id(),
            message,
            |session| aggregator.is_complete(session),
            |parts| {
                aggregator
                    .complete(parts, ctx)
                    .map_err(|err| BusError::from_handler(M::type_name(), err))
            },
        )
    }

    /// Append `message` to the session `(name, correlation_id)` and complete
    /// it when `is_complete` holds.
    pub fn handle_with<M, Pred, Done>(
        &self,
        name: &str,
        correlation_id: &str,
        message_id: &str,
        message: M,
        is_complete: Pred,
        on_complete: Done,
    ) -> Result<AggregateOutcome, BusError>
    where
        M: Serialize + DeserializeOwned,
        Pred: FnOnce(&AggregatorSession<M>) -> bool,
        Done: FnOnce(Vec<M>) -> Result<(), BusError>,
    {
        let _guard = lock_key(&self.locks, &format!("aggregator:{}:{}", name, correlation_id))?;

        let mut session = self
            .persistor
            .get::<M>(name, correlation_id)?
            .unwrap_or_else(|| AggregatorSession::new(correlation_id));

        let duplicate = session.contains(message_id);
        if duplicate {
            debug!(aggregator = name, correlation_id, message_id, "part already collected");
        } else {
            session.push(message_id, message);
            self.persistor.save(name, &session)?;
        }

        if !is_complete(&session) {
            return Ok(if duplicate {
                AggregateOutcome::Duplicate
            } else {
                debug!(
                    aggregator = name,
                    correlation_id,
                    received = session.len(),
                    "part collected"
                );
                AggregateOutcome::Pending {
                    received: session.len(),
                }
            });
        }

        let parts = session.len();
        on_complete(session.messages)?;
        self.persistor.delete(name, correlation_id)?;
        info!(aggregator = name, correlation_id, parts, "aggregation completed");
        Ok(AggregateOutcome::Completed { parts })
    }

    /// Reap expired sessions of `aggregator`, handing each to
    /// [`Aggregator::timed_out`]. Returns how many were reaped.
    pub fn sweep_expired<M, S, A>(&self, aggregator: &A) -> Result<usize, BusError>
    where
        M: Message,
        S: Serializer,
        A: Aggregator<M, S>,
    {
        self.sweep_with(M::type_name(), |session: AggregatorSession<M>| {
            aggregator.timed_out(session)
        })
    }

    pub fn sweep_with<M, F>(&self, name: &str, mut on_timeout: F) -> Result<usize, BusError>
    where
        M: DeserializeOwned,
        F: FnMut(AggregatorSession<M>),
    {
        let mut reaped = 0;
        for correlation_id in self.persistor.expired(name, self.timeout)? {
            let _guard = lock_key(&self.locks, &format!("aggregator:{}:{}", name, correlation_id))?;

            // Completed or replaced while we waited for the lock.
            let Some(session) = self.persistor.get::<M>(name, &correlation_id)? else {
                continue;
            };
            if session.age() < self.timeout {
                continue;
            }

            self.persistor.delete(name, &correlation_id)?;
            info!(
                aggregator = name,
                correlation_id = %correlation_id,
                parts = session.len(),
                "reaping expired aggregator session"
            );
            on_timeout(session);
            reaped += 1;
        }
        Ok(reaped)
    }
}
