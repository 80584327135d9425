//! Egress to the downstream append log
//!
//! [`RecordLog`] is the seam to the downstream client. [`EgressSink`] wraps
//! one shared log client for all workers, bounds each emit with a timeout,
//! tracks emits in flight, and flushes exactly once at shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

use crate::{IngestError, Result};

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod stdout;

#[cfg(feature = "kafka")]
pub use kafka::KafkaLog;
pub use memory::{MemoryLog, StoredRecord};
pub use stdout::StdoutLog;

/// Default upper bound on a single emit
pub const DEFAULT_EMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Acknowledgement of a durably accepted record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub partition: i32,
    pub offset: i64,
}

/// A partitioned append log accepting keyed records.
///
/// Implementations must tolerate concurrent `append` calls from every worker.
#[async_trait::async_trait]
pub trait RecordLog: Send + Sync + 'static {
    /// Append one record and wait for its acknowledgement
    async fn append(&self, key: &str, value: &[u8]) -> Result<Ack>;

    /// Wait until every previously appended record is durable or failed
    async fn flush(&self) -> Result<()>;

    /// Destination description for logs and errors
    fn describe(&self) -> String;
}

/// Partition for `key` among `partitions`.
///
/// Same mapping as the Kafka default partitioner for keyed records: the
/// positive part of the murmur2 hash modulo the partition count. Stable
/// across builds and shared with other producers on the topic.
pub fn partition_for(key: &str, partitions: usize) -> i32 {
    if partitions <= 1 {
        return 0;
    }

    let hash = murmur2::murmur2(key.as_bytes(), murmur2::KAFKA_SEED) & 0x7fff_ffff;
    (hash as usize % partitions) as i32
}

/// Shared adapter in front of the downstream log.
pub struct EgressSink {
    log: Arc<dyn RecordLog>,
    emit_timeout: Duration,
    in_flight: AtomicUsize,
    drained: Notify,
    flushed: Mutex<bool>,
}

/// Decrements the in-flight count even if the emit future is dropped or panics
struct InFlight<'a> {
    sink: &'a EgressSink,
}

impl<'a> InFlight<'a> {
    fn enter(sink: &'a EgressSink) -> Self {
        sink.in_flight.fetch_add(1, Ordering::AcqRel);
        Self { sink }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.sink.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.sink.drained.notify_waiters();
        }
    }
}

impl EgressSink {
    pub fn new(log: Arc<dyn RecordLog>) -> Self {
        Self {
            log,
            emit_timeout: DEFAULT_EMIT_TIMEOUT,
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            flushed: Mutex::new(false),
        }
    }

    /// Bound every emit by `timeout`
    pub fn with_emit_timeout(mut self, timeout: Duration) -> Self {
        self.emit_timeout = timeout;
        self
    }

    /// Submit one keyed record.
    ///
    /// Not retried here; the caller decides whether a failure deserves one
    /// more attempt.
    pub async fn emit(&self, key: &str, value: &[u8]) -> Result<Ack> {
        let _guard = InFlight::enter(self);

        match tokio::time::timeout(self.emit_timeout, self.log.append(key, value)).await {
            Ok(result) => result,
            Err(_) => Err(IngestError::Timeout { duration: self.emit_timeout }),
        }
    }

    /// Number of emits currently awaiting acknowledgement
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Destination of the wrapped log
    pub fn destination(&self) -> String {
        self.log.describe()
    }

    /// Wait for in-flight emits, then flush the log.
    ///
    /// Only the first call does any work; later calls return `Ok(false)`.
    pub async fn flush(&self) -> Result<bool> {
        let mut flushed = self.flushed.lock().await;
        if *flushed {
            debug!("Sink already flushed");
            return Ok(false);
        }
        *flushed = true;

        self.wait_drained().await;

        info!(destination = %self.log.describe(), "Flushing sink");
        self.log.flush().await?;
        Ok(true)
    }

    async fn wait_drained(&self) {
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            let pending = self.in_flight();
            if pending == 0 {
                return;
            }

            debug!(pending, "Waiting for in-flight emits before flush");
            drained.await;
        }
    }
}
