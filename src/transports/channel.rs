//! In-process transport driven by a handle
//!
//! Useful for embedding the pipeline behind another producer and for
//! exercising reconnect behaviour without a network: the handle can push
//! frames, drop the connection, make connect attempts fail, and end the
//! stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::transport::{Connection, Connector};
use crate::types::RawFrame;
use crate::{IngestError, Result};

#[derive(Debug)]
enum ChannelEvent {
    Frame(RawFrame),
    Disconnect(String),
    End,
}

#[derive(Debug)]
struct Shared {
    events: Mutex<mpsc::UnboundedReceiver<ChannelEvent>>,
    pending_connect_failures: AtomicU32,
    connects: AtomicUsize,
    connect_attempts: AtomicUsize,
}

/// Connector whose frames come from a [`ChannelHandle`].
#[derive(Debug, Clone)]
pub struct ChannelConnector {
    shared: Arc<Shared>,
}

/// Producer side of a [`ChannelConnector`].
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    tx: mpsc::UnboundedSender<ChannelEvent>,
    shared: Arc<Shared>,
}

impl ChannelConnector {
    /// Create a connector and the handle that feeds it
    pub fn new() -> (ChannelConnector, ChannelHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            events: Mutex::new(rx),
            pending_connect_failures: AtomicU32::new(0),
            connects: AtomicUsize::new(0),
            connect_attempts: AtomicUsize::new(0),
        });

        (ChannelConnector { shared: Arc::clone(&shared) }, ChannelHandle { tx, shared })
    }
}

impl ChannelHandle {
    /// Push a frame. Returns false once the connector side is gone.
    pub fn send(&self, payload: impl Into<Arc<[u8]>>) -> bool {
        self.tx.send(ChannelEvent::Frame(RawFrame::new(payload))).is_ok()
    }

    /// Push a text frame
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.tx.send(ChannelEvent::Frame(RawFrame::from_text(text))).is_ok()
    }

    /// Drop the current connection after the frames already pushed
    pub fn disconnect(&self, reason: impl Into<String>) -> bool {
        self.tx.send(ChannelEvent::Disconnect(reason.into())).is_ok()
    }

    /// End the stream after the frames already pushed
    pub fn finish(&self) -> bool {
        self.tx.send(ChannelEvent::End).is_ok()
    }

    /// Make the next `count` connect attempts fail with a transport error
    pub fn fail_next_connects(&self, count: u32) {
        self.shared.pending_connect_failures.store(count, Ordering::SeqCst);
    }

    /// Number of successful connects so far
    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Number of connect attempts so far, failed ones included
    pub fn connect_attempts(&self) -> usize {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Connector for ChannelConnector {
    type Connection = ChannelConnection;

    async fn connect(&self) -> Result<ChannelConnection> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let failed = self
            .shared
            .pending_connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(IngestError::transport("injected connect failure"));
        }

        let connection = self.shared.connects.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(connection, "Channel transport connected");
        Ok(ChannelConnection { shared: Arc::clone(&self.shared), open: true })
    }

    fn endpoint(&self) -> String {
        "channel".to_string()
    }
}

/// Connection backed by the shared channel.
#[derive(Debug)]
pub struct ChannelConnection {
    shared: Arc<Shared>,
    open: bool,
}

#[async_trait::async_trait]
impl Connection for ChannelConnection {
    async fn receive(&mut self) -> Result<Option<RawFrame>> {
        if !self.open {
            return Err(IngestError::connection_closed("connection already closed"));
        }

        let event = self.shared.events.lock().await.recv().await;
        match event {
            Some(ChannelEvent::Frame(frame)) => Ok(Some(frame)),
            Some(ChannelEvent::Disconnect(reason)) => {
                self.open = false;
                Err(IngestError::connection_closed(reason))
            }
            // Every handle dropped counts as end of stream
            Some(ChannelEvent::End) | None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }
}
