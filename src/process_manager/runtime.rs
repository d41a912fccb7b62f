//! Drives process manager transitions.

use tracing::{debug, info};

use super::{
    FindResult, ProcessManager, ProcessManagerData, ProcessManagerFinder, ProcessManagerStore,
    ProcessOutcome, ProcessRecord, Transition, Versioned,
};
use crate::bus::Context;
use crate::error::{BusError, HandlerError, StoreError};
use crate::lock::{lock_key, InMemoryLockManager, LockManager};
use crate::message::Message;
use crate::serializer::Serializer;

pub const DEFAULT_MAX_CONCURRENCY_RETRIES: u32 = 5;

/// Runs saga transitions against a store.
///
/// Messages for the same instance are serialized in-process with a keyed
/// lock. Across processes the store's version check catches concurrent
/// writers; a conflict re-reads the instance and re-applies the message, up
/// to `max_retries` times.
pub struct ProcessManagerRuntime<St, L = InMemoryLockManager> {
    finder: ProcessManagerFinder<St>,
    locks: L,
    max_retries: u32,
}

impl<St: ProcessManagerStore> ProcessManagerRuntime<St, InMemoryLockManager> {
    pub fn new(store: St) -> Self {
        Self::with_lock_manager(store, InMemoryLockManager::new())
    }
}

impl<St: ProcessManagerStore, L: LockManager> ProcessManagerRuntime<St, L> {
    pub fn with_lock_manager(store: St, locks: L) -> Self {
        Self {
            finder: ProcessManagerFinder::new(store),
            locks,
            max_retries: DEFAULT_MAX_CONCURRENCY_RETRIES,
        }
    }

    /// Conflict retries after the first attempt.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn finder(&self) -> &ProcessManagerFinder<St> {
        &self.finder
    }

    pub fn store(&self) -> &St {
        self.finder.store()
    }

    /// Correlate `message` to its instance and apply it.
    pub fn handle<M, S, P>(
        &self,
        manager: &P,
        message: &M,
        ctx: &Context<'_, S>,
    ) -> Result<ProcessOutcome, BusError>
    where
        M: Message,
        S: Serializer,
        P: ProcessManager<M, S>,
    {
        let collection = <P::Data as ProcessManagerData>::COLLECTION;
        let key = manager.correlation_key(message, ctx);
        let _guard = lock_key(&self.locks, &format!("{}:{}", collection, key))?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.apply_once(manager, &key, message, ctx) {
                Err(BusError::ConcurrencyConflict { .. }) if attempts <= self.max_retries => {
                    debug!(
                        collection,
                        key = %key,
                        message_id = ctx.message_id(),
                        attempts,
                        "concurrency conflict; reloading instance"
                    );
                }
                Err(BusError::ConcurrencyConflict { collection, key, .. }) => {
                    return Err(BusError::ConcurrencyConflict {
                        collection,
                        key,
                        attempts,
                    });
                }
                other => return other,
            }
        }
    }

    fn apply_once<M, S, P>(
        &self,
        manager: &P,
        key: &str,
        message: &M,
        ctx: &Context<'_, S>,
    ) -> Result<ProcessOutcome, BusError>
    where
        M: Message,
        S: Serializer,
        P: ProcessManager<M, S>,
    {
        let collection = <P::Data as ProcessManagerData>::COLLECTION;
        let message_id = ctx.message_id();
        let handler_err = |err: HandlerError| BusError::from_handler(M::type_name(), err);

        match self.finder.find_data::<P::Data>(key)? {
            FindResult::NotFound => {
                if !manager.is_starter() {
                    return Err(BusError::ConsistencyViolation {
                        collection: collection.to_string(),
                        key: key.to_string(),
                        message_type: M::type_name().to_string(),
                    });
                }

                let mut data = manager.new_data(key, message).map_err(handler_err)?;
                let transition = manager.handle(&mut data, message, ctx).map_err(handler_err)?;
                if transition == Transition::Complete {
                    info!(collection, key, message_id, "process started and completed");
                    return Ok(ProcessOutcome::Completed);
                }

                let mut record = ProcessRecord::new(key, data);
                record.record_handled(message_id);
                self.finder.insert_data(&record).map_err(conflict_on_missing)?;
                info!(collection, key, message_id, "process started");
                Ok(ProcessOutcome::Started)
            }
            FindResult::Found(Versioned {
                data: mut record,
                version,
            }) => {
                if record.has_handled(message_id) {
                    debug!(collection, key, message_id, "message already applied");
                    return Ok(ProcessOutcome::Duplicate);
                }

                let transition = manager
                    .handle(&mut record.data, message, ctx)
                    .map_err(handler_err)?;
                match transition {
                    Transition::Complete => {
                        self.finder
                            .delete_data::<P::Data>(key, version)
                            .map_err(conflict_on_missing)?;
                        info!(collection, key, message_id, "process completed");
                        Ok(ProcessOutcome::Completed)
                    }
                    Transition::Continue => {
                        record.record_handled(message_id);
                        let new_version = self
                            .finder
                            .update_data(&record, version)
                            .map_err(conflict_on_missing)?;
                        debug!(collection, key, message_id, version = new_version, "process updated");
                        Ok(ProcessOutcome::Updated)
                    }
                }
            }
        }
    }
}

/// An instance that vanished between read and write was changed by someone
/// else; treat it like a version mismatch so the message is re-evaluated.
fn conflict_on_missing(err: StoreError) -> BusError {
    match err {
        StoreError::NotFound { collection, id } => BusError::ConcurrencyConflict {
            collection,
            key: id,
            attempts: 1,
        },
        other => other.into(),
    }
}
