//! Error types for the ingestion pipeline.
//!
//! Every failure the pipeline can observe is expressed as an [`IngestError`].
//! Most of them are per-item and local: the stage that sees them records a
//! counter and carries on. Only connector-level failures and configuration
//! errors ever influence the lifecycle of the process.
//!
//! ## Error Categories
//!
//! - **Transport Errors**: the upstream endpoint could not be reached or misbehaved
//! - **Connection Closed**: an established stream went away (close frame, EOF, ping timeout)
//! - **Decode Errors**: a frame was not a well-formed event
//! - **Emit Errors**: the downstream log rejected or failed to acknowledge a record
//! - **Worker Faults**: a worker panicked while handling a single frame
//! - **Configuration Errors**: invalid settings detected before startup
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use firehose::IngestError;
//!
//! let error = IngestError::transport("connection refused");
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T, E = IngestError> = std::result::Result<T, E>;

/// Boxed error used as a source for wrapped third-party failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for the ingestion pipeline.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum IngestError {
    #[error("Transport error: {reason}")]
    Transport {
        reason: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Connection closed: {reason}")]
    ConnectionClosed { reason: String },

    #[error("Failed to decode frame: {details}")]
    Decode { details: String },

    #[error("Failed to emit record to {destination}: {reason}")]
    Emit {
        destination: String,
        reason: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Worker {worker_id} faulted: {details}")]
    WorkerFault { worker_id: usize, details: String },

    #[error("Invalid configuration for '{key}': {reason}")]
    Config { key: String, reason: String },

    #[error("Replay file error: {path}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },
}

impl IngestError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::Transport { .. } => true,
            IngestError::ConnectionClosed { .. } => true,
            IngestError::Timeout { .. } => true,
            IngestError::Emit { .. } => true,
            IngestError::Decode { .. } => false,
            IngestError::WorkerFault { .. } => false,
            IngestError::Config { .. } => false,
            IngestError::File { .. } => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            IngestError::Transport { .. } => vec![
                "Check the upstream URL and network connectivity",
                "Verify TLS roots are available for wss:// endpoints",
                "Wait for the reconnect backoff to elapse",
            ],
            IngestError::ConnectionClosed { .. } => vec![
                "Nothing to do, the receive loop reconnects automatically",
                "Increase the ping timeout if disconnects are frequent",
            ],
            IngestError::Decode { .. } => vec![
                "Check that the upstream emits JSON documents",
                "Verify the configured key path exists in every event",
            ],
            IngestError::Emit { .. } => vec![
                "Check the broker address list",
                "Verify the topic exists and brokers are healthy",
                "Increase the worker count if emits are timing out",
            ],
            IngestError::WorkerFault { .. } => vec![
                "Inspect the logs for the panicking frame",
                "Report the payload that triggered the fault",
            ],
            IngestError::Config { .. } => vec![
                "Review command-line flags and environment variables",
                "Check the YAML configuration file",
            ],
            IngestError::File { .. } => vec![
                "Check the replay file exists and is readable",
                "Ensure the file contains one frame per line",
            ],
            IngestError::Timeout { .. } => vec![
                "Increase timeout duration",
                "Check downstream responsiveness",
            ],
        }
    }

    /// Helper constructor for transport errors.
    pub fn transport(reason: impl Into<String>) -> Self {
        IngestError::Transport { reason: reason.into(), source: None }
    }

    /// Helper constructor for transport errors with source.
    pub fn transport_with_source(reason: impl Into<String>, source: BoxError) -> Self {
        IngestError::Transport { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for closed connections.
    pub fn connection_closed(reason: impl Into<String>) -> Self {
        IngestError::ConnectionClosed { reason: reason.into() }
    }

    /// Helper constructor for decode errors.
    pub fn decode(details: impl Into<String>) -> Self {
        IngestError::Decode { details: details.into() }
    }

    /// Helper constructor for emit errors.
    pub fn emit(destination: impl Into<String>, reason: impl Into<String>) -> Self {
        IngestError::Emit { destination: destination.into(), reason: reason.into(), source: None }
    }

    /// Helper constructor for emit errors with source.
    pub fn emit_with_source(
        destination: impl Into<String>,
        reason: impl Into<String>,
        source: BoxError,
    ) -> Self {
        IngestError::Emit {
            destination: destination.into(),
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Helper constructor for configuration errors.
    pub fn config(key: impl Into<String>, reason: impl Into<String>) -> Self {
        IngestError::Config { key: key.into(), reason: reason.into() }
    }

    /// Helper constructor for replay file errors with path context.
    pub fn file_error(path: PathBuf, source: std::io::Error) -> Self {
        IngestError::File { path, source }
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::Decode { details: err.to_string() }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for IngestError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                IngestError::connection_closed(err.to_string())
            }
            other => IngestError::transport_with_source("websocket failure", Box::new(other)),
        }
    }
}
