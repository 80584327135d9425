//! Decoded events and key extraction

use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use super::RawFrame;
use crate::{IngestError, Result};

/// Location of the partition key inside a decoded JSON document.
///
/// Written in dotted form (`commit.rev`) and resolved as a JSON pointer
/// (`/commit/rev`). String values are used verbatim, numbers are rendered
/// in decimal; anything else is not a usable key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPath {
    dotted: String,
    pointer: String,
}

impl KeyPath {
    /// Parse a dotted key path
    pub fn parse(dotted: &str) -> Result<Self> {
        let dotted = dotted.trim();
        if dotted.is_empty() {
            return Err(IngestError::config("key_path", "must not be empty"));
        }

        let mut pointer = String::with_capacity(dotted.len() + 1);
        for segment in dotted.split('.') {
            if segment.is_empty() {
                return Err(IngestError::config(
                    "key_path",
                    format!("'{}' contains an empty segment", dotted),
                ));
            }
            pointer.push('/');
            // RFC 6901 escaping
            pointer.push_str(&segment.replace('~', "~0").replace('/', "~1"));
        }

        Ok(Self { dotted: dotted.to_string(), pointer })
    }

    /// JSON pointer form of the path
    pub fn pointer(&self) -> &str {
        &self.pointer
    }

    /// Extract the key from a document
    pub fn extract(&self, document: &Value) -> Option<String> {
        match document.pointer(&self.pointer)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

impl Default for KeyPath {
    fn default() -> Self {
        Self { dotted: "commit.rev".to_string(), pointer: "/commit/rev".to_string() }
    }
}

impl FromStr for KeyPath {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        KeyPath::parse(s)
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dotted)
    }
}

/// A frame that parsed successfully and carries a partition key.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    /// Partition/ordering key (an event revision or sequence field)
    pub key: String,

    /// The parsed event document, used for key extraction
    pub value: Value,

    /// Payload bytes exactly as received; this is what gets emitted
    pub payload: Arc<[u8]>,

    /// Arrival time of the originating frame
    pub received_at: Instant,
}

impl DecodedEvent {
    /// Decode a raw frame.
    ///
    /// Fails with [`IngestError::Decode`] if the payload is not a JSON
    /// document or the key is missing.
    pub fn decode(frame: &RawFrame, key_path: &KeyPath) -> Result<Self> {
        let value: Value = serde_json::from_slice(frame.as_bytes())?;

        let key = key_path.extract(&value).ok_or_else(|| {
            IngestError::decode(format!("event has no usable key at '{}'", key_path))
        })?;

        Ok(Self { key, value, payload: Arc::clone(&frame.payload), received_at: frame.received_at })
    }

    /// Record value, byte for byte the payload that arrived
    pub fn value_bytes(&self) -> &[u8] {
        &self.payload
    }
}
