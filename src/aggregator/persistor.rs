use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};

use super::AggregatorSession;
use crate::error::StoreError;

/// Storage for in-flight aggregator sessions.
///
/// Sessions are addressed by `(name, correlation_id)`, where `name`
/// identifies the aggregator so two aggregators never share a session.
pub trait AggregatorPersistor: Send + Sync + 'static {
    fn get<M: DeserializeOwned>(
        &self,
        name: &str,
        correlation_id: &str,
    ) -> Result<Option<AggregatorSession<M>>, StoreError>;

    /// Insert or replace a session.
    fn save<M: Serialize>(&self, name: &str, session: &AggregatorSession<M>) -> Result<(), StoreError>;

    /// Remove a session. Returns true if it existed.
    fn delete(&self, name: &str, correlation_id: &str) -> Result<bool, StoreError>;

    /// Correlation ids of sessions created at least `older_than` ago.
    fn expired(&self, name: &str, older_than: Duration) -> Result<Vec<String>, StoreError>;
}

impl<P: AggregatorPersistor> AggregatorPersistor for std::sync::Arc<P> {
    fn get<M: DeserializeOwned>(
        &self,
        name: &str,
        correlation_id: &str,
    ) -> Result<Option<AggregatorSession<M>>, StoreError> {
        (**self).get(name, correlation_id)
    }

    fn save<M: Serialize>(&self, name: &str, session: &AggregatorSession<M>) -> Result<(), StoreError> {
        (**self).save(name, session)
    }

    fn delete(&self, name: &str, correlation_id: &str) -> Result<bool, StoreError> {
        (**self).delete(name, correlation_id)
    }

    fn expired(&self, name: &str, older_than: Duration) -> Result<Vec<String>, StoreError> {
        (**self).expired(name, older_than)
    }
}
