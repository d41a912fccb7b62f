//! Transport settings and queue mappings.
//!
//! Both are plain values built once by the embedding application (by hand,
//! with the `with_*` builders, or from JSON) and handed to the bus builder.
//! The bus owns them from then on; nothing here is global.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BusError;
use crate::message::Message;
use crate::transport::QueueOptions;

/// Resolved connection, queue, retry and audit configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub host: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// The bus's own queue: consumed from, and the default send endpoint.
    pub queue_name: String,
    /// Topic the queue is bound to in addition to the handled message types.
    pub routing_key: Option<String>,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub queue_arguments: BTreeMap<String, String>,
    pub error_queue: String,
    pub audit_queue: String,
    pub heartbeat_queue: Option<String>,
    pub auditing_enabled: bool,
    pub max_retries: u32,
    #[serde(with = "millis", rename = "retry_delay_ms")]
    pub retry_delay: Duration,
    pub purge_queue_on_startup: bool,
    pub no_ack: bool,
    /// Payload ceiling enforced by the producer, on top of the transport's own.
    pub max_message_size: Option<usize>,
    /// Delivery flows per consumer registration.
    pub concurrency: usize,
    #[serde(with = "millis", rename = "poll_interval_ms")]
    pub poll_interval: Duration,
    #[serde(with = "millis", rename = "reconnect_initial_backoff_ms")]
    pub reconnect_initial_backoff: Duration,
    #[serde(with = "millis", rename = "reconnect_max_backoff_ms")]
    pub reconnect_max_backoff: Duration,
    #[serde(with = "millis", rename = "shutdown_grace_ms")]
    pub shutdown_grace: Duration,
    /// Optimistic-concurrency retries for process manager updates.
    pub max_concurrency_retries: u32,
    #[serde(with = "millis", rename = "aggregator_timeout_ms")]
    pub aggregator_timeout: Duration,
    #[serde(with = "millis", rename = "aggregator_sweep_interval_ms")]
    pub aggregator_sweep_interval: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            username: None,
            password: None,
            queue_name: String::new(),
            routing_key: None,
            durable: true,
            exclusive: false,
            auto_delete: false,
            queue_arguments: BTreeMap::new(),
            error_queue: "errors".to_string(),
            audit_queue: "audit".to_string(),
            heartbeat_queue: None,
            auditing_enabled: false,
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            purge_queue_on_startup: false,
            no_ack: false,
            max_message_size: None,
            concurrency: 1,
            poll_interval: Duration::from_millis(50),
            reconnect_initial_backoff: Duration::from_millis(100),
            reconnect_max_backoff: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            max_concurrency_retries: 5,
            aggregator_timeout: Duration::from_secs(60),
            aggregator_sweep_interval: Duration::from_secs(1),
        }
    }
}

impl TransportSettings {
    /// Settings for the given queue with everything else defaulted.
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..Self::default()
        }
    }

    /// Parse settings from JSON. Missing fields take their defaults;
    /// the result is validated.
    pub fn from_json_str(json: &str) -> Result<Self, BusError> {
        let settings: Self = serde_json::from_str(json)
            .map_err(|e| BusError::Configuration(format!("invalid settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json_value(value: serde_json::Value) -> Result<Self, BusError> {
        let settings: Self = serde_json::from_value(value)
            .map_err(|e| BusError::Configuration(format!("invalid settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings the runtime cannot work with.
    pub fn validate(&self) -> Result<(), BusError> {
        if self.queue_name.trim().is_empty() {
            return Err(BusError::Configuration("queue_name is required".into()));
        }
        if self.host.trim().is_empty() {
            return Err(BusError::Configuration("host is required".into()));
        }
        if self.error_queue.trim().is_empty() {
            return Err(BusError::Configuration("error_queue is required".into()));
        }
        if self.auditing_enabled && self.audit_queue.trim().is_empty() {
            return Err(BusError::Configuration(
                "audit_queue is required when auditing is enabled".into(),
            ));
        }
        if self.error_queue == self.queue_name {
            return Err(BusError::Configuration(
                "error_queue must differ from queue_name".into(),
            ));
        }
        if self.concurrency == 0 {
            return Err(BusError::Configuration("concurrency must be at least 1".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(BusError::Configuration("poll_interval must be positive".into()));
        }
        if self.aggregator_sweep_interval.is_zero() {
            return Err(BusError::Configuration(
                "aggregator_sweep_interval must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Queue declaration options derived from these settings.
    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            arguments: self.queue_arguments.clone(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn with_error_queue(mut self, queue: impl Into<String>) -> Self {
        self.error_queue = queue.into();
        self
    }

    pub fn with_audit_queue(mut self, queue: impl Into<String>) -> Self {
        self.audit_queue = queue.into();
        self
    }

    pub fn with_heartbeat_queue(mut self, queue: impl Into<String>) -> Self {
        self.heartbeat_queue = Some(queue.into());
        self
    }

    pub fn with_auditing(mut self, enabled: bool) -> Self {
        self.auditing_enabled = enabled;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_purge_on_startup(mut self, purge: bool) -> Self {
        self.purge_queue_on_startup = purge;
        self
    }

    pub fn with_no_ack(mut self, no_ack: bool) -> Self {
        self.no_ack = no_ack;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = Some(size);
        self
    }

    pub fn with_concurrency(mut self, flows: usize) -> Self {
        self.concurrency = flows;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_reconnect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_initial_backoff = initial;
        self.reconnect_max_backoff = max;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_max_concurrency_retries(mut self, retries: u32) -> Self {
        self.max_concurrency_retries = retries;
        self
    }

    pub fn with_aggregator_timeout(mut self, timeout: Duration, sweep_interval: Duration) -> Self {
        self.aggregator_timeout = timeout;
        self.aggregator_sweep_interval = sweep_interval;
        self
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Routing table from message type name to destination queues.
///
/// Destinations keep insertion order and may repeat; a send goes to each
/// entry in turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueMappings {
    routes: HashMap<String, Vec<String>>,
}

impl QueueMappings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `M` to `queue` (appended after any existing destinations).
    pub fn map<M: Message>(self, queue: impl Into<String>) -> Self {
        self.map_type(M::type_name(), queue)
    }

    pub fn map_type(mut self, message_type: impl Into<String>, queue: impl Into<String>) -> Self {
        self.routes
            .entry(message_type.into())
            .or_default()
            .push(queue.into());
        self
    }

    pub fn destinations(&self, message_type: &str) -> Option<&[String]> {
        self.routes
            .get(message_type)
            .filter(|queues| !queues.is_empty())
            .map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
