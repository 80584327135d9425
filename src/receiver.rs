//! Receive loop: the single producer feeding the intake queue
//!
//! The loop does nothing per frame beyond counter updates and a non-blocking
//! queue admission. Parsing and sink I/O happen on the worker side.

use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use crate::connector::TransportConnector;
use crate::counters::StageCounters;
use crate::queue::{BoundedQueue, Rejected};
use crate::transport::{Connection, Connector};
use crate::types::{ConnectionState, RawFrame};

/// Why the receive loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Shutdown was requested
    Cancelled,
    /// A finite source reported end of stream
    SourceExhausted,
}

enum SessionEnd {
    Cancelled,
    Exhausted,
    Lost,
}

/// Reads frames from the transport and admits them to the queue.
pub struct ReceiveLoop<C: Connector> {
    transport: TransportConnector<C>,
    queue: Arc<BoundedQueue<RawFrame>>,
    counters: Arc<StageCounters>,
    shedding: bool,
    shed_in_streak: u64,
}

impl<C: Connector> ReceiveLoop<C> {
    pub fn new(
        transport: TransportConnector<C>,
        queue: Arc<BoundedQueue<RawFrame>>,
        counters: Arc<StageCounters>,
    ) -> Self {
        Self { transport, queue, counters, shedding: false, shed_in_streak: 0 }
    }

    /// Observe the transport's connection state
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.transport.subscribe()
    }

    /// Run until cancelled or the source is exhausted.
    ///
    /// Lost connections are re-established after the backoff; the queue and
    /// everything in it are untouched by reconnects.
    pub async fn run(mut self, cancel: CancellationToken) -> ReceiveOutcome {
        info!(endpoint = %self.transport.endpoint(), "Receive loop started");
        let mut sessions = 0u64;

        loop {
            let Some(mut connection) = self.transport.establish(&cancel).await else {
                info!("Receive loop cancelled before connecting");
                return ReceiveOutcome::Cancelled;
            };

            sessions += 1;
            if sessions > 1 {
                self.counters.record_reconnect();
            }

            let (end, frames) = self.receive_session(&mut connection, &cancel).await;

            match end {
                SessionEnd::Cancelled => {
                    info!(frames, "Receive loop cancelled, closing upstream");
                    self.transport.close(&mut connection).await;
                    return ReceiveOutcome::Cancelled;
                }
                SessionEnd::Exhausted => {
                    info!(frames, "Upstream source exhausted");
                    self.transport.close(&mut connection).await;
                    return ReceiveOutcome::SourceExhausted;
                }
                SessionEnd::Lost => {
                    drop(connection);
                    if !self.transport.wait_backoff(&cancel).await {
                        info!("Receive loop cancelled during reconnect backoff");
                        return ReceiveOutcome::Cancelled;
                    }
                }
            }
        }
    }

    async fn receive_session(
        &mut self,
        connection: &mut C::Connection,
        cancel: &CancellationToken,
    ) -> (SessionEnd, u64) {
        let mut frames = 0u64;

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return (SessionEnd::Cancelled, frames),
                result = connection.receive() => result,
            };

            match result {
                Ok(Some(frame)) => {
                    frames += 1;
                    self.admit(frame);
                }
                Ok(None) => return (SessionEnd::Exhausted, frames),
                Err(e) => {
                    self.transport.mark_disconnected();
                    warn!(error = %e, frames, "Connection lost, reconnecting after backoff");
                    return (SessionEnd::Lost, frames);
                }
            }
        }
    }

    /// Count and admit one frame. Never waits.
    fn admit(&mut self, frame: RawFrame) {
        self.counters.record_received();

        // Counted before a worker can see the frame, so processed never runs ahead of enqueued
        match self.queue.try_enqueue_with(frame, || self.counters.record_enqueued()) {
            Ok(()) => {
                if self.shedding {
                    info!(shed = self.shed_in_streak, "Queue admitting frames again");
                    self.shedding = false;
                    self.shed_in_streak = 0;
                }
            }
            Err(rejected) => {
                self.counters.record_dropped();
                self.shed_in_streak += 1;
                if !self.shedding {
                    self.shedding = true;
                    let reason = match rejected {
                        Rejected::Full(_) => "full",
                        Rejected::Closed(_) => "closed",
                    };
                    warn!(
                        depth = self.queue.len(),
                        capacity = self.queue.capacity(),
                        "Queue {}, dropping frames",
                        reason
                    );
                } else {
                    trace!("Dropped frame");
                }
            }
        }
    }
}
