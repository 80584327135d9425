//! Transport connector: connection state machine and reconnect backoff

use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::{Connection, Connector};
use crate::types::ConnectionState;

/// Default wait between a connection failure and the next attempt
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Upper bound on a graceful close handshake
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns a [`Connector`] and the [`ConnectionState`] of its connection.
///
/// Connection failures never end the pipeline: [`establish`](Self::establish)
/// retries after a fixed backoff until it succeeds or shutdown is requested.
pub struct TransportConnector<C: Connector> {
    connector: C,
    backoff: Duration,
    state: watch::Sender<ConnectionState>,
}

impl<C: Connector> TransportConnector<C> {
    pub fn new(connector: C, backoff: Duration) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self { connector, backoff, state }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Endpoint of the wrapped connector
    pub fn endpoint(&self) -> String {
        self.connector.endpoint()
    }

    /// Connect, retrying after the backoff until success.
    ///
    /// Returns `None` only when `cancel` fires.
    pub async fn establish(&self, cancel: &CancellationToken) -> Option<C::Connection> {
        let mut attempt = 0u64;

        loop {
            if cancel.is_cancelled() {
                return None;
            }

            attempt += 1;
            self.transition(ConnectionState::Connecting);

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    self.transition(ConnectionState::Disconnected);
                    return None;
                }
                result = self.connector.connect() => result,
            };

            match result {
                Ok(connection) => {
                    self.transition(ConnectionState::Connected);
                    info!(endpoint = %self.connector.endpoint(), attempt, "Connected to upstream");
                    return Some(connection);
                }
                Err(e) => {
                    self.transition(ConnectionState::Disconnected);
                    warn!(
                        endpoint = %self.connector.endpoint(),
                        attempt,
                        error = %e,
                        "Connection error, reconnecting in {:?}",
                        self.backoff
                    );

                    if !self.wait_backoff(cancel).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Sleep for the backoff interval. Returns false if cancelled first.
    pub async fn wait_backoff(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.backoff) => true,
            _ = cancel.cancelled() => false,
        }
    }

    /// Record that an established connection was lost
    pub fn mark_disconnected(&self) {
        self.transition(ConnectionState::Disconnected);
    }

    /// Close a connection for shutdown: `Closing`, close handshake, `Disconnected`.
    pub async fn close(&self, connection: &mut C::Connection) {
        self.transition(ConnectionState::Closing);

        match tokio::time::timeout(CLOSE_TIMEOUT, connection.close()).await {
            Ok(Ok(())) => debug!("Upstream connection closed"),
            Ok(Err(e)) => warn!(error = %e, "Error while closing upstream connection"),
            Err(_) => warn!("Close handshake timed out after {:?}", CLOSE_TIMEOUT),
        }

        self.transition(ConnectionState::Disconnected);
    }

    fn transition(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous == next {
            return;
        }

        if previous.can_transition_to(next) {
            debug!(from = %previous, to = %next, "Connection state changed");
        } else {
            warn!(from = %previous, to = %next, "Unexpected connection state transition");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transports::ChannelConnector;

    #[tokio::test]
    async fn establish_retries_until_connected() {
        let (connector, handle) = ChannelConnector::new();
        handle.fail_next_connects(3);

        let transport = TransportConnector::new(connector, Duration::from_millis(5));
        let states = transport.subscribe();
        let cancel = CancellationToken::new();

        let connection = transport.establish(&cancel).await;
        assert!(connection.is_some());
        assert_eq!(handle.connect_attempts(), 4);
        assert_eq!(*states.borrow(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_is_a_fixed_interval() {
        let (connector, handle) = ChannelConnector::new();
        handle.fail_next_connects(2);

        let transport = TransportConnector::new(connector, DEFAULT_RECONNECT_BACKOFF);
        let cancel = CancellationToken::new();

        let start = tokio::time::Instant::now();
        assert!(transport.establish(&cancel).await.is_some());

        // Two failures, two full backoffs, no growth
        let elapsed = start.elapsed();
        assert!(elapsed >= DEFAULT_RECONNECT_BACKOFF * 2);
        assert!(elapsed < DEFAULT_RECONNECT_BACKOFF * 2 + Duration::from_millis(100));
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let (connector, handle) = ChannelConnector::new();
        handle.fail_next_connects(u32::MAX);

        let transport = TransportConnector::new(connector, Duration::from_secs(3600));
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let outcome = tokio::time::timeout(Duration::from_secs(2), transport.establish(&cancel)).await;
        assert!(outcome.expect("establish should observe cancellation").is_none());
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn close_passes_through_closing() {
        let (connector, _handle) = ChannelConnector::new();
        let transport = TransportConnector::new(connector, Duration::from_millis(5));
        let mut states = transport.subscribe();

        let mut connection = transport.establish(&CancellationToken::new()).await.unwrap();
        states.mark_unchanged();

        transport.close(&mut connection).await;
        assert!(states.has_changed().unwrap());
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }
}
