//! Transport traits for upstream event sources

use crate::Result;
use crate::types::RawFrame;

/// Factory for connections to an upstream stream.
///
/// A connector is long-lived and reused across reconnects; every call to
/// [`connect`](Connector::connect) performs a fresh handshake.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connection type produced by a successful handshake
    type Connection: Connection;

    /// Establish a new connection
    ///
    /// Returns:
    /// - `Ok(connection)` - Handshake completed, frames can be received
    /// - `Err(e)` - Transport error; the caller backs off and retries
    async fn connect(&self) -> Result<Self::Connection>;

    /// Human-readable endpoint description for logs
    fn endpoint(&self) -> String;
}

/// An established upstream connection.
#[async_trait::async_trait]
pub trait Connection: Send + 'static {
    /// Get the next frame
    ///
    /// Returns:
    /// - `Ok(Some(frame))` - A frame arrived
    /// - `Ok(None)` - A finite source is exhausted (live streams never return this)
    /// - `Err(e)` - The connection is gone (closed, ping timeout, protocol error)
    ///
    /// Must be cancel-safe: dropping the future between frames loses nothing.
    async fn receive(&mut self) -> Result<Option<RawFrame>>;

    /// Close the connection gracefully
    async fn close(&mut self) -> Result<()>;
}
