//! Conversion between typed responses and stored bytes
//!
//! Responses pass through `serde_json::Value` on their way to a
//! `PayloadCodec`, which turns that value into bytes. The codec is the
//! pluggable piece; JSON is the default.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

use super::token::response_type_name;

/// Errors raised while converting responses to or from stored bytes
#[derive(Debug, Error)]
pub enum SerializationError {
    /// The response could not be converted to its storable form
    #[error("Failed to serialize response: {0}")]
    Serialize(String),

    /// Stored bytes could not be turned back into a response
    #[error("Failed to deserialize stored entry: {0}")]
    Deserialize(String),

    /// The stored entry was written for a different response type
    #[error("Stored entry has type '{found}', expected '{expected}'")]
    TypeMismatch { expected: String, found: String },
}

/// Encodes intermediate values into bytes and back
pub trait PayloadCodec: Debug + Send + Sync {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, SerializationError>;

    fn decode(&self, bytes: &[u8]) -> Result<Value, SerializationError>;
}

/// JSON codec, compact or pretty-printed
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec {
    pub pretty: bool,
}

impl PayloadCodec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, SerializationError> {
        let encoded = if self.pretty {
            serde_json::to_vec_pretty(value)
        } else {
            serde_json::to_vec(value)
        };
        encoded.map_err(|e| SerializationError::Serialize(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, SerializationError> {
        serde_json::from_slice(bytes).map_err(|e| SerializationError::Deserialize(e.to_string()))
    }
}

/// Converts typed responses to stored payloads and back
#[derive(Debug, Clone)]
pub struct SerializationManager {
    codec: Arc<dyn PayloadCodec>,
}

impl Default for SerializationManager {
    fn default() -> Self {
        Self::new(Arc::new(JsonCodec::default()))
    }
}

impl SerializationManager {
    pub fn new(codec: Arc<dyn PayloadCodec>) -> Self {
        Self { codec }
    }

    /// Serializes a response into bytes suitable for the store
    pub fn serialize<T: Serialize>(&self, response: &T) -> Result<Vec<u8>, SerializationError> {
        let value =
            serde_json::to_value(response).map_err(|e| SerializationError::Serialize(e.to_string()))?;
        self.codec.encode(&value)
    }

    /// Deserializes a stored payload into `T`
    ///
    /// # Arguments
    /// * `bytes` - The stored payload
    /// * `stored_type` - The response type recorded alongside the payload
    ///
    /// # Returns
    /// * `Err(SerializationError::TypeMismatch)` if the entry belongs to another type
    /// * `Err(SerializationError::Deserialize)` on malformed data
    pub fn deserialize<T: DeserializeOwned>(
        &self,
        bytes: &[u8],
        stored_type: &str,
    ) -> Result<T, SerializationError> {
        self.deserialize_tagged(bytes, stored_type, response_type_name::<T>())
    }

    /// Deserializes a stored payload recorded under an explicit type tag
    pub fn deserialize_tagged<T: DeserializeOwned>(
        &self,
        bytes: &[u8],
        stored_type: &str,
        expected: &str,
    ) -> Result<T, SerializationError> {
        if stored_type != expected {
            return Err(SerializationError::TypeMismatch {
                expected: expected.to_string(),
                found: stored_type.to_string(),
            });
        }

        let value = self.codec.decode(bytes)?;
        serde_json::from_value(value).map_err(|e| SerializationError::Deserialize(e.to_string()))
    }
}
