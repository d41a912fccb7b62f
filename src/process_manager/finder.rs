//! Typed lookup and persistence of process manager instances.

use super::{ProcessManagerData, ProcessManagerStore, ProcessRecord, Versioned};
use crate::error::StoreError;

/// Outcome of a lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum FindResult<T> {
    Found(Versioned<T>),
    NotFound,
}

impl<T> FindResult<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, FindResult::Found(_))
    }

    pub fn into_option(self) -> Option<Versioned<T>> {
        match self {
            FindResult::Found(found) => Some(found),
            FindResult::NotFound => None,
        }
    }
}

/// Finds, creates, updates and deletes instances of `D` in a store.
#[derive(Clone)]
pub struct ProcessManagerFinder<St> {
    store: St,
}

impl<St: ProcessManagerStore> ProcessManagerFinder<St> {
    pub fn new(store: St) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &St {
        &self.store
    }

    pub fn find_data<D: ProcessManagerData>(
        &self,
        key: &str,
    ) -> Result<FindResult<ProcessRecord<D>>, StoreError> {
        Ok(match self.store.find_by_key(D::COLLECTION, key)? {
            Some(found) => FindResult::Found(found),
            None => FindResult::NotFound,
        })
    }

    pub fn insert_data<D: ProcessManagerData>(
        &self,
        record: &ProcessRecord<D>,
    ) -> Result<u64, StoreError> {
        self.store.insert(D::COLLECTION, &record.key, record)
    }

    pub fn update_data<D: ProcessManagerData>(
        &self,
        record: &ProcessRecord<D>,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        self.store
            .update(D::COLLECTION, &record.key, record, expected_version)
    }

    pub fn delete_data<D: ProcessManagerData>(
        &self,
        key: &str,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        self.store.delete(D::COLLECTION, key, expected_version)
    }
}
