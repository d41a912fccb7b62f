use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use super::{Lock, LockError, LockManager};

/// Blocking per-key lock. `held` flips under the mutex and waiters park on
/// the condvar until it clears.
#[derive(Default)]
pub struct InMemoryLock {
    held: Mutex<bool>,
    released: Condvar,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> Result<MutexGuard<'_, bool>, LockError> {
        self.held
            .lock()
            .map_err(|_| LockError::Poisoned("keyed lock state".into()))
    }
}

impl Lock for InMemoryLock {
    fn lock(&self) -> Result<(), LockError> {
        let held = self.held()?;
        let mut held = self
            .released
            .wait_while(held, |held| *held)
            .map_err(|_| LockError::Poisoned("keyed lock wait".into()))?;
        *held = true;
        Ok(())
    }

    fn try_lock(&self) -> Result<bool, LockError> {
        let mut held = self.held()?;
        Ok(!std::mem::replace(&mut *held, true))
    }

    fn unlock(&self) -> Result<(), LockError> {
        let mut held = self.held()?;
        if std::mem::replace(&mut *held, false) {
            self.released.notify_one();
        }
        Ok(())
    }
}

/// In-memory lock manager: one `InMemoryLock` per key, created lazily and
/// dropped again once no guard or waiter references it.
#[derive(Default)]
pub struct InMemoryLockManager {
    locks: Mutex<HashMap<String, Arc<InMemoryLock>>>,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }
}

impl LockManager for InMemoryLockManager {
    type Lock = InMemoryLock;

    fn get_lock(&self, key: &str) -> Result<Arc<InMemoryLock>, LockError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| LockError::Poisoned("keyed lock table".into()))?;
        let lock = locks.entry(key.to_string()).or_default();
        Ok(Arc::clone(lock))
    }

    fn release(&self, key: &str) {
        if let Ok(mut locks) = self.locks.lock() {
            // Only the map holds it: no guard, no waiter.
            if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(key);
            }
        }
    }
}
