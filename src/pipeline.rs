//! Pipeline assembly and lifecycle
//!
//! [`Pipeline::spawn`] wires the stages together and starts one receive task,
//! the worker pool and the health monitor. Shutdown runs in a fixed order:
//! stop receiving, close the queue, let workers drain it, flush the sink
//! once, then take a final health report.

use futures::StreamExt;
use futures::stream::BoxStream;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::connector::TransportConnector;
use crate::counters::{CountersSnapshot, StageCounters};
use crate::health::{HealthMonitor, HealthReport};
use crate::queue::BoundedQueue;
use crate::receiver::{ReceiveLoop, ReceiveOutcome};
use crate::sink::{EgressSink, RecordLog};
use crate::transport::Connector;
use crate::types::{ConnectionState, RawFrame};
use crate::workers::{WorkerContext, WorkerPool, WorkerStats};
use crate::Result;

/// What a completed shutdown observed
#[derive(Debug, Clone)]
pub struct ShutdownSummary {
    /// Why the receive loop stopped
    pub outcome: ReceiveOutcome,
    /// Counters after the queue was drained
    pub totals: CountersSnapshot,
    pub workers: Vec<WorkerStats>,
    /// Whether this shutdown performed the sink flush
    pub flushed: bool,
    pub final_report: Option<HealthReport>,
}

/// A running ingestion pipeline.
///
/// Dropping a pipeline without calling [`shutdown`](Self::shutdown) cancels
/// its tasks without draining or flushing.
pub struct Pipeline {
    counters: Arc<StageCounters>,
    queue: Arc<BoundedQueue<RawFrame>>,
    sink: Arc<EgressSink>,
    connection: watch::Receiver<ConnectionState>,
    reports: watch::Receiver<Option<Arc<HealthReport>>>,

    receive: Option<JoinHandle<ReceiveOutcome>>,
    workers: Option<WorkerPool>,
    health: Option<JoinHandle<HealthReport>>,

    receive_cancel: CancellationToken,
    health_cancel: CancellationToken,
    exhausted: CancellationToken,
}

impl Pipeline {
    /// Validate `config` and start every stage. Must be called within a
    /// tokio runtime.
    pub fn spawn<C: Connector>(config: &PipelineConfig, connector: C, log: Arc<dyn RecordLog>) -> Result<Self> {
        config.validate()?;
        let key_path = Arc::new(config.parsed_key_path()?);

        let counters = Arc::new(StageCounters::new());
        let queue = Arc::new(BoundedQueue::new(config.queue_capacity));
        let sink = Arc::new(EgressSink::new(log).with_emit_timeout(config.emit_timeout()));

        let transport = TransportConnector::new(connector, config.reconnect_backoff());
        let endpoint = transport.endpoint();
        let receive_loop = ReceiveLoop::new(transport, Arc::clone(&queue), Arc::clone(&counters));
        let connection = receive_loop.connection_state();

        let receive_cancel = CancellationToken::new();
        let health_cancel = CancellationToken::new();
        let exhausted = CancellationToken::new();

        let receive = {
            let cancel = receive_cancel.clone();
            let exhausted = exhausted.clone();
            tokio::spawn(async move {
                let outcome = receive_loop.run(cancel).await;
                if outcome == ReceiveOutcome::SourceExhausted {
                    exhausted.cancel();
                }
                outcome
            })
        };

        let workers = WorkerPool::spawn(
            config.workers,
            WorkerContext {
                queue: Arc::clone(&queue),
                sink: Arc::clone(&sink),
                counters: Arc::clone(&counters),
                key_path,
                dequeue_timeout: config.dequeue_timeout(),
                retry_emit: config.emit_retry,
            },
        );

        let monitor = HealthMonitor::new(
            Arc::clone(&counters),
            Arc::clone(&queue),
            connection.clone(),
            config.report_interval(),
            config.backpressure_threshold,
        );
        let (health, reports) = monitor.spawn(health_cancel.clone());

        info!(
            endpoint = %endpoint,
            destination = %sink.destination(),
            capacity = config.queue_capacity,
            workers = config.workers,
            "Pipeline started"
        );

        Ok(Self {
            counters,
            queue,
            sink,
            connection,
            reports,
            receive: Some(receive),
            workers: Some(workers),
            health: Some(health),
            receive_cancel,
            health_cancel,
            exhausted,
        })
    }

    /// Current counter values
    pub fn counters(&self) -> CountersSnapshot {
        self.counters.snapshot()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    /// Shared egress sink
    pub fn sink(&self) -> &Arc<EgressSink> {
        &self.sink
    }

    /// Most recent health report, if one was taken yet
    pub fn latest_report(&self) -> Option<Arc<HealthReport>> {
        self.reports.borrow().clone()
    }

    /// Stream of health reports, starting with the latest one
    pub fn reports(&self) -> BoxStream<'static, Arc<HealthReport>> {
        WatchStream::new(self.reports.clone()).filter_map(|report| async move { report }).boxed()
    }

    /// Whether a finite source has ended
    pub fn is_source_exhausted(&self) -> bool {
        self.exhausted.is_cancelled()
    }

    /// Run until `shutdown` resolves or the source is exhausted, then shut down.
    pub async fn run_until<F>(self, shutdown: F) -> Result<ShutdownSummary>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            _ = shutdown => info!("Shutdown requested, draining pipeline"),
            _ = self.exhausted.cancelled() => info!("Source exhausted, draining pipeline"),
        }

        self.shutdown().await
    }

    /// Stop receiving, drain the queue, flush once and take a final report.
    ///
    /// Returns an error only if the sink flush failed; the summary is logged
    /// either way.
    pub async fn shutdown(mut self) -> Result<ShutdownSummary> {
        self.receive_cancel.cancel();
        let outcome = match self.receive.take() {
            Some(handle) => handle.await.unwrap_or_else(|e| {
                error!(error = %e, "Receive task ended abnormally");
                ReceiveOutcome::Cancelled
            }),
            None => ReceiveOutcome::Cancelled,
        };
        debug!(?outcome, "Receive loop stopped");

        self.queue.close();
        let workers = match self.workers.take() {
            Some(pool) => pool.join().await,
            None => Vec::new(),
        };
        debug!(workers = workers.len(), "Workers drained the queue");

        let flush = self.sink.flush().await;
        if let Err(e) = &flush {
            error!(error = %e, "Sink flush failed");
        }

        self.health_cancel.cancel();
        let final_report = match self.health.take() {
            Some(handle) => match handle.await {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!(error = %e, "Health monitor ended abnormally");
                    None
                }
            },
            None => None,
        };

        let totals = self.counters.snapshot();
        info!(
            received = totals.received,
            enqueued = totals.enqueued,
            dropped = totals.dropped,
            processed = totals.processed,
            errors = totals.errors,
            "Pipeline stopped"
        );

        let flushed = flush?;
        Ok(ShutdownSummary { outcome, totals, workers, flushed, final_report })
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.receive.is_some() {
            debug!("Dropping running pipeline");
        }
        self.receive_cancel.cancel();
        self.health_cancel.cancel();
        self.queue.close();
    }
}

/// Build the configured downstream log
pub async fn connect_log(config: &PipelineConfig) -> Result<Arc<dyn RecordLog>> {
    use crate::config::SinkKind;
    use crate::sink::{MemoryLog, StdoutLog};

    match config.sink {
        #[cfg(feature = "kafka")]
        SinkKind::Kafka => {
            let log = crate::sink::KafkaLog::connect(
                config.broker_list(),
                config.topic.clone(),
                config.partitions,
                config.replication_factor,
            )
            .await?;
            Ok(Arc::new(log))
        }
        #[cfg(not(feature = "kafka"))]
        SinkKind::Kafka => Err(crate::IngestError::config("sink", "built without the `kafka` feature")),
        SinkKind::Stdout => Ok(Arc::new(StdoutLog::new())),
        SinkKind::Memory => Ok(Arc::new(MemoryLog::new(config.topic.clone(), config.partitions.max(1) as usize))),
    }
}
