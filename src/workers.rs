//! Worker pool draining the intake queue
//!
//! Each worker decodes a frame and emits it through the shared sink. Every
//! failure is local to the frame that caused it: decode errors, emit errors
//! and panics are counted and the worker moves on.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::IngestError;
use crate::counters::StageCounters;
use crate::queue::{BoundedQueue, Dequeued};
use crate::sink::EgressSink;
use crate::types::{DecodedEvent, KeyPath, RawFrame};

/// Default number of workers
pub const DEFAULT_WORKERS: usize = 4;

/// Default dequeue wait; only bounds how often a worker re-checks the queue
pub const DEFAULT_DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything a worker needs, shared by all workers.
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: Arc<BoundedQueue<RawFrame>>,
    pub sink: Arc<EgressSink>,
    pub counters: Arc<StageCounters>,
    pub key_path: Arc<KeyPath>,
    pub dequeue_timeout: Duration,
    /// Retry a failed emit once before counting it as an error
    pub retry_emit: bool,
}

/// Per-worker tallies returned when a worker exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub worker_id: usize,
    pub processed: u64,
    pub failed: u64,
    pub idle_polls: u64,
}

enum FrameOutcome {
    Processed,
    Failed,
}

/// A fixed set of worker tasks.
pub struct WorkerPool {
    handles: Vec<JoinHandle<WorkerStats>>,
}

impl WorkerPool {
    /// Spawn `count` workers sharing `context`
    pub fn spawn(count: usize, context: WorkerContext) -> Self {
        let handles = (0..count)
            .map(|worker_id| {
                let context = context.clone();
                tokio::spawn(async move { run_worker(worker_id, context).await })
            })
            .collect();

        info!(workers = count, "Worker pool started");
        Self { handles }
    }

    /// Wait for every worker to exit.
    ///
    /// Workers exit once the queue is closed and drained.
    pub async fn join(self) -> Vec<WorkerStats> {
        let mut stats = Vec::with_capacity(self.handles.len());

        for (worker_id, handle) in self.handles.into_iter().enumerate() {
            match handle.await {
                Ok(worker) => stats.push(worker),
                Err(e) => {
                    error!(worker_id, error = %e, "Worker task ended abnormally");
                    stats.push(WorkerStats { worker_id, ..Default::default() });
                }
            }
        }

        stats
    }
}

async fn run_worker(worker_id: usize, context: WorkerContext) -> WorkerStats {
    debug!(worker_id, "Worker started");
    let mut stats = WorkerStats { worker_id, ..Default::default() };

    loop {
        let frame = match context.queue.dequeue(context.dequeue_timeout).await {
            Dequeued::Item(frame) => frame,
            Dequeued::TimedOut => {
                stats.idle_polls += 1;
                trace!(worker_id, "Queue idle");
                continue;
            }
            Dequeued::Closed => break,
        };

        let outcome = AssertUnwindSafe(handle_frame(worker_id, &context, frame)).catch_unwind().await;

        match outcome {
            Ok(FrameOutcome::Processed) => stats.processed += 1,
            Ok(FrameOutcome::Failed) => stats.failed += 1,
            Err(panic) => {
                stats.failed += 1;
                context.counters.record_worker_fault();
                let fault = fault_from_panic(worker_id, &*panic);
                error!(worker_id, error = %fault, "Frame abandoned, worker continues");
            }
        }
    }

    debug!(
        worker_id,
        processed = stats.processed,
        failed = stats.failed,
        "Worker drained queue and stopped"
    );
    stats
}

async fn handle_frame(worker_id: usize, context: &WorkerContext, frame: RawFrame) -> FrameOutcome {
    let event = match DecodedEvent::decode(&frame, &context.key_path) {
        Ok(event) => event,
        Err(e) => {
            context.counters.record_decode_error();
            debug!(worker_id, error = %e, bytes = frame.len(), "Skipping malformed frame");
            return FrameOutcome::Failed;
        }
    };

    let value = event.value_bytes();

    let result = match context.sink.emit(&event.key, value).await {
        Err(e) if context.retry_emit && e.is_retryable() => {
            context.counters.record_emit_retry();
            debug!(worker_id, key = %event.key, error = %e, "Emit failed, retrying once");
            context.sink.emit(&event.key, value).await
        }
        first => first,
    };

    match result {
        Ok(ack) => {
            context.counters.record_processed();
            trace!(
                worker_id,
                key = %event.key,
                partition = ack.partition,
                offset = ack.offset,
                latency = ?event.received_at.elapsed(),
                "Emitted event"
            );
            FrameOutcome::Processed
        }
        Err(e) => {
            context.counters.record_emit_error();
            warn!(worker_id, key = %event.key, error = %e, "Dropping event after emit failure");
            FrameOutcome::Failed
        }
    }
}

fn fault_from_panic(worker_id: usize, panic: &(dyn Any + Send)) -> IngestError {
    let details = if let Some(message) = panic.downcast_ref::<&'static str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    };
    IngestError::WorkerFault { worker_id, details }
}
