use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};

use super::{AggregatorPersistor, AggregatorSession};
use crate::error::StoreError;
use crate::producer::now_millis;

struct StoredSession {
    name: String,
    correlation_id: String,
    bytes: Vec<u8>,
    created_at_ms: u64,
}

/// HashMap-backed session storage. Clone-friendly via Arc.
#[derive(Clone, Default)]
pub struct InMemoryAggregatorPersistor {
    sessions: Arc<RwLock<HashMap<String, StoredSession>>>,
}

impl InMemoryAggregatorPersistor {
    pub fn new() -> Self {
        Self::default()
    }

    fn make_key(name: &str, correlation_id: &str) -> String {
        format!("{}:{}", name, correlation_id)
    }

    /// Number of live sessions across all aggregators.
    pub fn len(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AggregatorPersistor for InMemoryAggregatorPersistor {
    fn get<M: DeserializeOwned>(
        &self,
        name: &str,
        correlation_id: &str,
    ) -> Result<Option<AggregatorSession<M>>, StoreError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".into()))?;
        match sessions.get(&Self::make_key(name, correlation_id)) {
            Some(stored) => serde_json::from_slice(&stored.bytes)
                .map(Some)
                .map_err(|e| StoreError::Serde(e.to_string())),
            None => Ok(None),
        }
    }

    fn save<M: Serialize>(&self, name: &str, session: &AggregatorSession<M>) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(session).map_err(|e| StoreError::Serde(e.to_string()))?;
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".into()))?;
        sessions.insert(
            Self::make_key(name, &session.correlation_id),
            StoredSession {
                name: name.to_string(),
                correlation_id: session.correlation_id.clone(),
                bytes,
                created_at_ms: session.created_at_ms,
            },
        );
        Ok(())
    }

    fn delete(&self, name: &str, correlation_id: &str) -> Result<bool, StoreError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".into()))?;
        Ok(sessions.remove(&Self::make_key(name, correlation_id)).is_some())
    }

    fn expired(&self, name: &str, older_than: Duration) -> Result<Vec<String>, StoreError> {
        let now = now_millis() as u64;
        let threshold = older_than.as_millis() as u64;
        let sessions = self
            .sessions
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".into()))?;
        Ok(sessions
            .values()
            .filter(|s| s.name == name && now.saturating_sub(s.created_at_ms) >= threshold)
            .map(|s| s.correlation_id.clone())
            .collect())
    }
}
