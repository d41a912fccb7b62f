//! Messages: the typed domain side and the transport side.
//!
//! Application code works with [`Message`] types wrapped in an [`Envelope`].
//! The producer serializes the body and turns the envelope into a
//! [`TransportMessage`]: opaque payload bytes plus string headers, which is
//! all a transport ever sees.

use std::collections::BTreeMap;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

/// Header names written and read by the bus.
pub mod headers {
    pub const MESSAGE_ID: &str = "x-message-id";
    pub const CORRELATION_ID: &str = "x-correlation-id";
    pub const MESSAGE_TYPE: &str = "x-message-type";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const REPLY_TO: &str = "x-reply-to";
    pub const INTENT: &str = "x-message-intent";
    pub const RETRY_COUNT: &str = "x-retry-count";
    pub const FAILURE_KIND: &str = "x-failure-kind";
    pub const FAILURE_REASON: &str = "x-failure-reason";
    pub const SOURCE_QUEUE: &str = "x-source-queue";
    pub const SENT_AT: &str = "x-sent-at";

    /// Intent value marking a message as a reply to a request.
    pub const INTENT_REPLY: &str = "reply";

    /// Headers owned by the bus. Caller-supplied headers may not use these.
    pub const RESERVED: &[&str] = &[
        MESSAGE_ID,
        CORRELATION_ID,
        MESSAGE_TYPE,
        CONTENT_TYPE,
        REPLY_TO,
        INTENT,
        RETRY_COUNT,
        FAILURE_KIND,
        FAILURE_REASON,
        SOURCE_QUEUE,
        SENT_AT,
    ];

    pub fn is_reserved(name: &str) -> bool {
        RESERVED.iter().any(|reserved| reserved.eq_ignore_ascii_case(name))
    }
}

/// A domain message that can travel on the bus.
///
/// `type_name()` is the logical name used for queue mappings, publish topics
/// and handler dispatch. Usually derived:
///
/// ```ignore
/// #[derive(Serialize, Deserialize, Message)]
/// #[message(name = "OrderPlaced")]
/// struct OrderPlaced { order_id: String }
/// ```
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn type_name() -> &'static str;
}

/// A message body together with its identity and caller headers.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<M> {
    id: String,
    correlation_id: Option<String>,
    headers: BTreeMap<String, String>,
    body: M,
}

impl<M> Envelope<M> {
    /// Wrap a body with a fresh message id.
    pub fn new(body: M) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            correlation_id: None,
            headers: BTreeMap::new(),
            body,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Add a caller header. Reserved names are rejected when the envelope is sent.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The correlation id; defaults to the message id when none was set.
    pub fn correlation_id(&self) -> &str {
        self.correlation_id.as_deref().unwrap_or(&self.id)
    }

    pub fn has_explicit_correlation(&self) -> bool {
        self.correlation_id.is_some()
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn body(&self) -> &M {
        &self.body
    }

    pub fn into_body(self) -> M {
        self.body
    }
}

impl<M: Message> From<M> for Envelope<M> {
    fn from(body: M) -> Self {
        Envelope::new(body)
    }
}

/// What a transport carries: headers plus opaque payload bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportMessage {
    pub headers: BTreeMap<String, String>,
    #[serde(with = "payload_serde")]
    pub payload: Vec<u8>,
}

mod payload_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(payload: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(payload).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

impl TransportMessage {
    /// Create a message carrying the three identity headers.
    pub fn new(
        id: impl Into<String>,
        message_type: impl Into<String>,
        correlation_id: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(headers::MESSAGE_ID.to_string(), id.into());
        headers.insert(headers::MESSAGE_TYPE.to_string(), message_type.into());
        headers.insert(headers::CORRELATION_ID.to_string(), correlation_id.into());
        Self { headers, payload }
    }

    /// Create a message with a string payload.
    pub fn with_string_payload(
        id: impl Into<String>,
        message_type: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self::new(id.clone(), message_type, id, payload.into().into_bytes())
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    /// Message id, or `""` for foreign messages without one.
    pub fn id(&self) -> &str {
        self.header(headers::MESSAGE_ID).unwrap_or_default()
    }

    pub fn message_type(&self) -> &str {
        self.header(headers::MESSAGE_TYPE).unwrap_or_default()
    }

    /// Correlation id, falling back to the message id.
    pub fn correlation_id(&self) -> &str {
        self.header(headers::CORRELATION_ID)
            .unwrap_or_else(|| self.id())
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.header(headers::REPLY_TO)
    }

    pub fn is_reply(&self) -> bool {
        self.header(headers::INTENT) == Some(headers::INTENT_REPLY)
    }

    /// Number of redeliveries so far. Missing or garbled headers count as zero.
    pub fn retry_count(&self) -> u32 {
        self.header(headers::RETRY_COUNT)
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    }

    /// Get the payload as a string (if valid UTF-8).
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}
