//! Payload serializers.
//!
//! The bus never looks inside a payload; it hands bodies to a [`Serializer`]
//! and records the serializer's content type in the message headers.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::BusError;

/// Converts message bodies to and from transport payload bytes.
pub trait Serializer: Send + Sync + 'static {
    /// MIME-style content type written to the `content-type` header.
    fn content_type(&self) -> &'static str;

    fn serialize<M: Serialize>(&self, message: &M, type_name: &str) -> Result<Vec<u8>, BusError>;

    /// Decode `bytes` as the type named by `type_hint`. Failures are
    /// reported as [`BusError::DeserializationFailed`].
    fn deserialize<M: DeserializeOwned>(&self, bytes: &[u8], type_hint: &str) -> Result<M, BusError>;
}

/// JSON payloads via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn serialize<M: Serialize>(&self, message: &M, type_name: &str) -> Result<Vec<u8>, BusError> {
        serde_json::to_vec(message).map_err(|e| BusError::SerializationFailed {
            message_type: type_name.to_string(),
            reason: e.to_string(),
        })
    }

    fn deserialize<M: DeserializeOwned>(&self, bytes: &[u8], type_hint: &str) -> Result<M, BusError> {
        serde_json::from_slice(bytes).map_err(|e| BusError::DeserializationFailed {
            message_type: type_hint.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Compact binary payloads via `bitcode`.
#[cfg(feature = "bitcode")]
#[derive(Debug, Clone, Copy, Default)]
pub struct BitcodeSerializer;

#[cfg(feature = "bitcode")]
impl Serializer for BitcodeSerializer {
    fn content_type(&self) -> &'static str {
        "application/x-bitcode"
    }

    fn serialize<M: Serialize>(&self, message: &M, type_name: &str) -> Result<Vec<u8>, BusError> {
        bitcode::serialize(message).map_err(|e| BusError::SerializationFailed {
            message_type: type_name.to_string(),
            reason: e.to_string(),
        })
    }

    fn deserialize<M: DeserializeOwned>(&self, bytes: &[u8], type_hint: &str) -> Result<M, BusError> {
        bitcode::deserialize(bytes).map_err(|e| BusError::DeserializationFailed {
            message_type: type_hint.to_string(),
            reason: e.to_string(),
        })
    }
}
