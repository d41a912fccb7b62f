//! InMemoryProcessManagerStore - HashMap-backed saga store for testing and
//! single-process deployments.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{de::DeserializeOwned, Serialize};

use super::{ProcessManagerStore, Versioned};
use crate::error::StoreError;

struct StoredRecord {
    bytes: Vec<u8>,
    version: u64,
}

/// In-memory process manager store.
///
/// Storage key is `"COLLECTION:key"`, values are JSON. Clone-friendly via Arc.
#[derive(Clone, Default)]
pub struct InMemoryProcessManagerStore {
    storage: Arc<RwLock<HashMap<String, StoredRecord>>>,
}

impl InMemoryProcessManagerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn make_key(collection: &str, key: &str) -> String {
        format!("{}:{}", collection, key)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, StoredRecord>>, StoreError> {
        self.storage
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, StoredRecord>>, StoreError> {
        self.storage
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".into()))
    }

    /// Current version of an instance, if stored.
    pub fn version(&self, collection: &str, key: &str) -> Option<u64> {
        self.read()
            .ok()?
            .get(&Self::make_key(collection, key))
            .map(|stored| stored.version)
    }

    pub fn contains(&self, collection: &str, key: &str) -> bool {
        self.version(collection, key).is_some()
    }

    /// Number of stored instances across all collections.
    pub fn len(&self) -> usize {
        self.read().map(|storage| storage.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ProcessManagerStore for InMemoryProcessManagerStore {
    fn find_by_key<T: DeserializeOwned>(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<Versioned<T>>, StoreError> {
        let storage = self.read()?;
        match storage.get(&Self::make_key(collection, key)) {
            Some(stored) => {
                let data: T = serde_json::from_slice(&stored.bytes)
                    .map_err(|e| StoreError::Serde(e.to_string()))?;
                Ok(Some(Versioned {
                    data,
                    version: stored.version,
                }))
            }
            None => Ok(None),
        }
    }

    fn insert<T: Serialize>(&self, collection: &str, key: &str, data: &T) -> Result<u64, StoreError> {
        let bytes = serde_json::to_vec(data).map_err(|e| StoreError::Serde(e.to_string()))?;
        let storage_key = Self::make_key(collection, key);
        let mut storage = self.write()?;

        if let Some(existing) = storage.get(&storage_key) {
            return Err(StoreError::ConcurrencyConflict {
                collection: collection.to_string(),
                id: key.to_string(),
                expected: 0,
                actual: existing.version,
            });
        }

        storage.insert(storage_key, StoredRecord { bytes, version: 1 });
        Ok(1)
    }

    fn update<T: Serialize>(
        &self,
        collection: &str,
        key: &str,
        data: &T,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let bytes = serde_json::to_vec(data).map_err(|e| StoreError::Serde(e.to_string()))?;
        let storage_key = Self::make_key(collection, key);
        let mut storage = self.write()?;

        let stored = expect_version(&mut storage, &storage_key, collection, key, expected_version)?;
        stored.bytes = bytes;
        stored.version += 1;
        Ok(stored.version)
    }

    fn delete(&self, collection: &str, key: &str, expected_version: u64) -> Result<(), StoreError> {
        let storage_key = Self::make_key(collection, key);
        let mut storage = self.write()?;

        expect_version(&mut storage, &storage_key, collection, key, expected_version)?;
        storage.remove(&storage_key);
        Ok(())
    }
}

/// The stored record, provided it is still at `expected` version.
fn expect_version<'a>(
    storage: &'a mut HashMap<String, StoredRecord>,
    storage_key: &str,
    collection: &str,
    key: &str,
    expected: u64,
) -> Result<&'a mut StoredRecord, StoreError> {
    let stored = storage.get_mut(storage_key).ok_or_else(|| StoreError::NotFound {
        collection: collection.to_string(),
        id: key.to_string(),
    })?;
    if stored.version != expected {
        return Err(StoreError::ConcurrencyConflict {
            collection: collection.to_string(),
            id: key.to_string(),
            expected,
            actual: stored.version,
        });
    }
    Ok(stored)
}
