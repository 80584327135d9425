//! Connection lifecycle states

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of the upstream connection.
///
/// ```text
/// Disconnected -> Connecting -> Connected -> Disconnected   (error, close, ping timeout)
///                               Connected -> Closing -> Disconnected   (shutdown)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Connected, Closing)
                | (Closing, Disconnected)
                // Shutdown can arrive while a connect attempt or backoff is in progress
                | (Disconnected, Closing)
                | (Connecting, Closing)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
        };
        f.write_str(name)
    }
}
