//! Process-wide stage counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomically updated counters shared by every pipeline stage.
///
/// All counters start at zero and only ever increase. The receive loop is the
/// sole writer of `received`, `enqueued` and `dropped`; workers write the rest.
#[derive(Debug, Default)]
pub struct StageCounters {
    received: AtomicU64,
    enqueued: AtomicU64,
    dropped: AtomicU64,
    processed: AtomicU64,
    errors: AtomicU64,

    decode_errors: AtomicU64,
    emit_errors: AtomicU64,
    emit_retries: AtomicU64,
    worker_faults: AtomicU64,
    reconnects: AtomicU64,
}

/// Point-in-time copy of [`StageCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    pub received: u64,
    pub enqueued: u64,
    pub dropped: u64,
    pub processed: u64,
    pub errors: u64,
    pub decode_errors: u64,
    pub emit_errors: u64,
    pub emit_retries: u64,
    pub worker_faults: u64,
    pub reconnects: u64,
}

impl StageCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// A frame arrived from the transport
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Release);
    }

    /// A frame was admitted to the queue
    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Release);
    }

    /// A frame was shed because the queue was full
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Release);
    }

    /// A frame was decoded and emitted
    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Release);
    }

    /// A frame failed to decode
    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Release);
        self.errors.fetch_add(1, Ordering::Release);
    }

    /// A frame could not be emitted after the allowed attempts
    pub fn record_emit_error(&self) {
        self.emit_errors.fetch_add(1, Ordering::Release);
        self.errors.fetch_add(1, Ordering::Release);
    }

    /// A worker faulted while handling a frame
    pub fn record_worker_fault(&self) {
        self.worker_faults.fetch_add(1, Ordering::Release);
        self.errors.fetch_add(1, Ordering::Release);
    }

    /// An emit was retried (not a failure by itself)
    pub fn record_emit_retry(&self) {
        self.emit_retries.fetch_add(1, Ordering::Release);
    }

    /// The transport was re-established after a disconnect
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Release);
    }

    /// Read all counters.
    ///
    /// Counters are read downstream-first, so a concurrent observer always
    /// sees `processed + errors <= enqueued` and `enqueued + dropped <= received`.
    /// Both become equalities once the pipeline is idle.
    pub fn snapshot(&self) -> CountersSnapshot {
        let processed = self.processed.load(Ordering::Acquire);
        let errors = self.errors.load(Ordering::Acquire);
        let enqueued = self.enqueued.load(Ordering::Acquire);
        let dropped = self.dropped.load(Ordering::Acquire);

        CountersSnapshot {
            received: self.received.load(Ordering::Acquire),
            enqueued,
            dropped,
            processed,
            errors,
            decode_errors: self.decode_errors.load(Ordering::Acquire),
            emit_errors: self.emit_errors.load(Ordering::Acquire),
            emit_retries: self.emit_retries.load(Ordering::Acquire),
            worker_faults: self.worker_faults.load(Ordering::Acquire),
            reconnects: self.reconnects.load(Ordering::Acquire),
        }
    }
}

impl CountersSnapshot {
    /// Frames admitted to the queue that no worker has finished with yet
    pub fn in_flight(&self) -> u64 {
        self.enqueued.saturating_sub(self.processed + self.errors)
    }
}
