//! Keyed locks used to serialize work per correlation id.
//!
//! Process manager updates and aggregator appends for the same correlation
//! id must not run concurrently. Both take a [`KeyGuard`] from a
//! [`LockManager`] before touching persisted state.

mod in_memory;

use std::sync::Arc;

use thiserror::Error;

pub use in_memory::{InMemoryLock, InMemoryLockManager};

/// Error type for lock operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The underlying lock primitive was poisoned (a thread panicked while holding it).
    #[error("lock poisoned: {0}")]
    Poisoned(String),
}

/// Trait for a single lock instance.
///
/// In-memory locks use `Mutex` + `Condvar`; a distributed deployment might
/// back this with Redis or Postgres advisory locks.
pub trait Lock: Send + Sync {
    /// Acquire the lock, blocking until it becomes available.
    fn lock(&self) -> Result<(), LockError>;

    /// Try to acquire the lock without blocking.
    /// Returns `Ok(true)` if acquired, `Ok(false)` if already held.
    fn try_lock(&self) -> Result<bool, LockError>;

    /// Release the lock.
    fn unlock(&self) -> Result<(), LockError>;
}

/// Factory for per-key locks.
pub trait LockManager: Send + Sync {
    type Lock: Lock;

    /// Get (or create) the lock for `key`. Repeated calls with the same key
    /// return the same logical lock.
    fn get_lock(&self, key: &str) -> Result<Arc<Self::Lock>, LockError>;

    /// Hint that the caller is done with `key`. Implementations may drop
    /// idle locks so the key space does not grow without bound.
    fn release(&self, _key: &str) {}
}

/// RAII guard for a keyed lock. Unlocks (and releases the key) on drop.
pub struct KeyGuard<'a, M: LockManager> {
    manager: &'a M,
    key: String,
    lock: Option<Arc<M::Lock>>,
}

impl<'a, M: LockManager> KeyGuard<'a, M> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl<M: LockManager> Drop for KeyGuard<'_, M> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            if let Err(err) = lock.unlock() {
                tracing::error!(key = %self.key, error = %err, "failed to release keyed lock");
            }
            drop(lock);
            self.manager.release(&self.key);
        }
    }
}

/// Block until the lock for `key` is held, returning a guard.
pub fn lock_key<'a, M: LockManager>(manager: &'a M, key: &str) -> Result<KeyGuard<'a, M>, LockError> {
    let lock = manager.get_lock(key)?;
    lock.lock()?;
    Ok(KeyGuard {
        manager,
        key: key.to_string(),
        lock: Some(lock),
    })
}
