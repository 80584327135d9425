//! Raw frames as they arrive from the transport

use std::sync::Arc;
use std::time::Instant;

/// One discrete message unit received from the upstream stream, pre-decode.
///
/// The payload is shared via `Arc` so moving a frame through the queue never
/// copies the bytes.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Frame payload exactly as received (text frames are stored as UTF-8)
    pub payload: Arc<[u8]>,

    /// Arrival timestamp, taken when the transport handed the frame over
    pub received_at: Instant,
}

impl RawFrame {
    /// Create a frame stamped with the current instant
    pub fn new(payload: impl Into<Arc<[u8]>>) -> Self {
        Self { payload: payload.into(), received_at: Instant::now() }
    }

    /// Create a frame from a text message
    pub fn from_text(text: impl Into<String>) -> Self {
        Self::new(text.into().into_bytes())
    }

    /// Payload bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.payload
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
