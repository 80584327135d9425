//! Periodic health reporting
//!
//! The monitor runs on its own task and only reads shared state: counter
//! snapshots, the queue depth and the connection state. It never blocks the
//! receive loop or the workers.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::counters::{CountersSnapshot, StageCounters};
use crate::queue::BoundedQueue;
use crate::types::{ConnectionState, RawFrame};

/// Default reporting interval
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Default queue fill ratio above which backpressure is reported
pub const DEFAULT_BACKPRESSURE_THRESHOLD: f64 = 0.5;

/// One health sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// Seconds since the monitor started
    pub elapsed_secs: f64,
    /// Seconds covered by the per-interval rates
    pub interval_secs: f64,
    /// Frames received per second over the last interval
    pub receive_rate: f64,
    /// Events emitted per second over the last interval
    pub process_rate: f64,
    /// Frames received per second since start
    pub cumulative_receive_rate: f64,
    /// Events emitted per second since start
    pub cumulative_process_rate: f64,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub totals: CountersSnapshot,
    pub error_count: u64,
    /// Queue depth is above the warning threshold
    pub backpressure: bool,
    pub connection: ConnectionState,
}

/// Samples pipeline state and reports it on a fixed interval.
pub struct HealthMonitor {
    counters: Arc<StageCounters>,
    queue: Arc<BoundedQueue<RawFrame>>,
    connection: watch::Receiver<ConnectionState>,
    interval: Duration,
    threshold: f64,
    started: Instant,
    last_at: Instant,
    last: CountersSnapshot,
}

impl HealthMonitor {
    pub fn new(
        counters: Arc<StageCounters>,
        queue: Arc<BoundedQueue<RawFrame>>,
        connection: watch::Receiver<ConnectionState>,
        interval: Duration,
        threshold: f64,
    ) -> Self {
        let now = Instant::now();
        let last = counters.snapshot();
        Self { counters, queue, connection, interval, threshold, started: now, last_at: now, last }
    }

    /// Take a sample now and advance the interval baseline.
    pub fn sample(&mut self) -> HealthReport {
        let now = Instant::now();
        let totals = self.counters.snapshot();
        let queue_depth = self.queue.len();
        let queue_capacity = self.queue.capacity();

        let elapsed = now.duration_since(self.started).as_secs_f64();
        let interval = now.duration_since(self.last_at).as_secs_f64();

        let report = HealthReport {
            elapsed_secs: elapsed,
            interval_secs: interval,
            receive_rate: rate(totals.received - self.last.received, interval),
            process_rate: rate(totals.processed - self.last.processed, interval),
            cumulative_receive_rate: rate(totals.received, elapsed),
            cumulative_process_rate: rate(totals.processed, elapsed),
            queue_depth,
            queue_capacity,
            totals,
            error_count: totals.errors,
            backpressure: queue_depth as f64 > self.threshold * queue_capacity as f64,
            connection: *self.connection.borrow(),
        };

        self.last = totals;
        self.last_at = now;
        report
    }

    /// Run the monitor until `cancel` fires.
    ///
    /// Every report is logged and published on the returned watch channel.
    /// The task resolves to the final report taken at shutdown.
    pub fn spawn(
        mut self,
        cancel: CancellationToken,
    ) -> (JoinHandle<HealthReport>, watch::Receiver<Option<Arc<HealthReport>>>) {
        let (tx, rx) = watch::channel(None);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(self.started + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(interval = ?self.interval, threshold = self.threshold, "Health monitor started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = self.sample();
                        log_report(&report, "Health report");
                        tx.send_replace(Some(Arc::new(report)));
                    }
                }
            }

            let report = self.sample();
            log_report(&report, "Final health report");
            tx.send_replace(Some(Arc::new(report.clone())));
            report
        });

        (handle, rx)
    }
}

fn rate(count: u64, secs: f64) -> f64 {
    if secs > 0.0 { count as f64 / secs } else { 0.0 }
}

fn log_report(report: &HealthReport, message: &str) {
    let totals = &report.totals;
    info!(
        elapsed_secs = format_args!("{:.1}", report.elapsed_secs),
        receive_rate = format_args!("{:.1}", report.receive_rate),
        process_rate = format_args!("{:.1}", report.process_rate),
        cumulative_receive_rate = format_args!("{:.1}", report.cumulative_receive_rate),
        cumulative_process_rate = format_args!("{:.1}", report.cumulative_process_rate),
        queue_depth = report.queue_depth,
        queue_capacity = report.queue_capacity,
        received = totals.received,
        enqueued = totals.enqueued,
        dropped = totals.dropped,
        processed = totals.processed,
        errors = report.error_count,
        reconnects = totals.reconnects,
        connection = %report.connection,
        "{}",
        message
    );

    if report.backpressure {
        warn!(
            queue_depth = report.queue_depth,
            queue_capacity = report.queue_capacity,
            "BACKPRESSURE WARNING: queue is {}/{}",
            report.queue_depth,
            report.queue_capacity
        );
    }
}
