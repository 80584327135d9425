//! WebSocket transport for subscribe-style firehose endpoints

use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep_until, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async_with_config};
use tracing::{debug, info, trace};

use crate::transport::{Connection, Connector};
use crate::types::RawFrame;
use crate::{IngestError, Result};

/// Default interval between keep-alive pings
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);
/// Default time to wait for a pong before declaring the connection dead
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(60);
/// Default handshake timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Connector for a WebSocket stream endpoint.
///
/// ```rust
/// use firehose::transports::WebSocketConnector;
/// use std::time::Duration;
///
/// let connector = WebSocketConnector::subscribe(
///     "wss://jetstream2.us-west.bsky.network/subscribe",
///     &["app.bsky.feed.post".to_string()],
/// )
/// .ping_interval(Duration::from_secs(20))
/// .ping_timeout(Duration::from_secs(60));
///
/// assert!(connector.url().ends_with("?wantedCollections=app.bsky.feed.post"));
/// ```
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    ping_interval: Duration,
    ping_timeout: Duration,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    /// Connector for a fully formed URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Connector for a subscription endpoint filtered to the given collections
    pub fn subscribe(base_url: &str, collections: &[String]) -> Self {
        Self::new(subscription_url(base_url, collections))
    }

    /// Set the keep-alive ping interval
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set how long to wait for a pong
    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Set the handshake timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Target URL including filter parameters
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Append one `wantedCollections` parameter per collection to `base_url`.
pub fn subscription_url(base_url: &str, collections: &[String]) -> String {
    let mut url = base_url.to_string();
    let mut separator = if base_url.contains('?') { '&' } else { '?' };

    for collection in collections.iter().map(|c| c.trim()).filter(|c| !c.is_empty()) {
        url.push(separator);
        url.push_str("wantedCollections=");
        url.push_str(collection);
        separator = '&';
    }

    url
}

#[async_trait::async_trait]
impl Connector for WebSocketConnector {
    type Connection = WebSocketConnection;

    async fn connect(&self) -> Result<WebSocketConnection> {
        debug!(url = %self.url, "Opening websocket");

        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(MAX_MESSAGE_SIZE);
        config.max_frame_size = Some(MAX_MESSAGE_SIZE);

        let handshake = connect_async_with_config(self.url.as_str(), Some(config), true);
        let (stream, response) = match timeout(self.connect_timeout, handshake).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => {
                return Err(IngestError::transport_with_source(
                    format!("handshake with {} failed", self.url),
                    Box::new(e),
                ));
            }
            Err(_) => {
                return Err(IngestError::transport(format!(
                    "handshake with {} timed out after {:?}",
                    self.url, self.connect_timeout
                )));
            }
        };

        info!(url = %self.url, status = %response.status(), "Websocket connected");

        Ok(WebSocketConnection::new(stream, self.ping_interval, self.ping_timeout))
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}

/// An open WebSocket stream with keep-alive.
///
/// A ping goes out every `ping_interval`; if the matching pong has not
/// arrived within `ping_timeout`, [`receive`](Connection::receive) fails with
/// [`IngestError::ConnectionClosed`].
pub struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ping_timer: Interval,
    ping_timeout: Duration,
    ping_sent_at: Option<Instant>,
}

impl WebSocketConnection {
    fn new(
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        ping_interval: Duration,
        ping_timeout: Duration,
    ) -> Self {
        let mut ping_timer = interval_at(Instant::now() + ping_interval, ping_interval);
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self { stream, ping_timer, ping_timeout, ping_sent_at: None }
    }

    async fn send_ping(&mut self) -> Result<()> {
        // One outstanding ping at a time; the deadline runs from the first unanswered one
        if self.ping_sent_at.is_none() {
            self.ping_sent_at = Some(Instant::now());
        }
        trace!("Sending keep-alive ping");
        self.stream.send(Message::Ping(Vec::new())).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Connection for WebSocketConnection {
    async fn receive(&mut self) -> Result<Option<RawFrame>> {
        loop {
            let pong_deadline = self.ping_sent_at.map(|sent| sent + self.ping_timeout);

            tokio::select! {
                message = self.stream.next() => match message {
                    Some(Ok(Message::Text(text))) => return Ok(Some(RawFrame::from_text(text))),
                    Some(Ok(Message::Binary(bytes))) => return Ok(Some(RawFrame::new(bytes))),
                    Some(Ok(Message::Ping(payload))) => {
                        self.stream.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        trace!("Pong received");
                        self.ping_sent_at = None;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        let reason = match frame {
                            Some(frame) => format!(
                                "server closed the stream ({}: {})",
                                u16::from(frame.code),
                                frame.reason
                            ),
                            None => "server closed the stream".to_string(),
                        };
                        return Err(IngestError::connection_closed(reason));
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(IngestError::connection_closed("stream ended")),
                },
                _ = self.ping_timer.tick() => self.send_ping().await?,
                _ = sleep_until(pong_deadline.unwrap_or_else(Instant::now)), if pong_deadline.is_some() => {
                    return Err(IngestError::connection_closed(format!(
                        "no pong within {:?}",
                        self.ping_timeout
                    )));
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self.stream.close(None).await {
            Ok(()) => Ok(()),
            Err(e) => match IngestError::from(e) {
                // Already gone is as good as closed
                IngestError::ConnectionClosed { .. } => Ok(()),
                other => Err(other),
            },
        }
    }
}
