//! ProcessManagerStore - narrow persistence contract for saga state.

use serde::{de::DeserializeOwned, Serialize};

use super::Versioned;
use crate::error::StoreError;

/// Versioned key/value storage for process manager instances.
///
/// Instances are addressed by `(collection, key)`. Versions start at 1 on
/// insert and grow by one on every update.
pub trait ProcessManagerStore: Send + Sync + 'static {
    /// Load an instance. Returns None if not found.
    fn find_by_key<T: DeserializeOwned>(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<Versioned<T>>, StoreError>;

    /// Insert a new instance. Fails with `ConcurrencyConflict` if it exists.
    fn insert<T: Serialize>(&self, collection: &str, key: &str, data: &T) -> Result<u64, StoreError>;

    /// Replace an instance if its version still matches `expected_version`.
    fn update<T: Serialize>(
        &self,
        collection: &str,
        key: &str,
        data: &T,
        expected_version: u64,
    ) -> Result<u64, StoreError>;

    /// Delete an instance if its version still matches `expected_version`.
    fn delete(&self, collection: &str, key: &str, expected_version: u64) -> Result<(), StoreError>;
}

impl<St: ProcessManagerStore> ProcessManagerStore for std::sync::Arc<St> {
    fn find_by_key<T: DeserializeOwned>(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<Versioned<T>>, StoreError> {
        (**self).find_by_key(collection, key)
    }

    fn insert<T: Serialize>(&self, collection: &str, key: &str, data: &T) -> Result<u64, StoreError> {
        (**self).insert(collection, key, data)
    }

    fn update<T: Serialize>(
        &self,
        collection: &str,
        key: &str,
        data: &T,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        (**self).update(collection, key, data, expected_version)
    }

    fn delete(&self, collection: &str, key: &str, expected_version: u64) -> Result<(), StoreError> {
        (**self).delete(collection, key, expected_version)
    }
}
