//! Message type and wire codec.
//!
//! A message crossing a transport is encoded as one JSON object per line.
//! The payload is an opaque `serde_json::Value`: structured data sent from one
//! process arrives at a peer as a generic JSON value, not as the concrete type
//! it was built from.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Auxiliary metadata carried alongside a message.
pub type Headers = HashMap<String, Value>;

/// Errors from encoding or decoding a wire record.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Message has an empty event name")]
    EmptyEvent,
}

/// The unit of communication on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Name identifying the kind of occurrence.
    pub event: String,
    /// Opaque payload.
    #[serde(default)]
    pub data: Value,
    /// Optional metadata, never interpreted by the bus.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
}

impl Message {
    /// Create a message with a payload.
    pub fn new(event: impl Into<String>, data: impl Into<Value>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
            headers: None,
        }
    }

    /// Create a message with no payload.
    pub fn event(event: impl Into<String>) -> Self {
        Self::new(event, Value::Null)
    }

    /// Add a header, creating the header map if needed.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Look up a header value.
    pub fn header(&self, key: &str) -> Option<&Value> {
        self.headers.as_ref().and_then(|h| h.get(key))
    }

    /// Payload as a string slice, if it is a JSON string.
    pub fn data_str(&self) -> Option<&str> {
        self.data.as_str()
    }

    /// Encode as a single newline-terminated record.
    pub fn encode_line(&self) -> Result<Vec<u8>, MessageError> {
        let mut bytes = serde_json::to_vec(self).map_err(MessageError::Encode)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Decode one record (with or without its trailing newline).
    pub fn decode_line(line: &str) -> Result<Self, MessageError> {
        Self::decode_record(line.as_bytes())
    }

    /// Decode one record from raw bytes.
    pub fn decode_record(record: &[u8]) -> Result<Self, MessageError> {
        let msg: Message = serde_json::from_slice(record).map_err(MessageError::Decode)?;
        if msg.event.is_empty() {
            return Err(MessageError::EmptyEvent);
        }
        Ok(msg)
    }
}
