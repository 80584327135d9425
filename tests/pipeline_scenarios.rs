//! End-to-end pipeline scenarios over the in-process transport and log

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use firehose::config::{PipelineConfig, SinkKind};
use firehose::receiver::ReceiveOutcome;
use firehose::sink::{Ack, MemoryLog, RecordLog};
use firehose::transports::{ChannelConnector, ReplayConnector};
use firehose::{Pipeline, Result};
use futures::StreamExt;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config(queue_capacity: usize, workers: usize) -> PipelineConfig {
    PipelineConfig {
        sink: SinkKind::Memory,
        queue_capacity,
        workers,
        dequeue_timeout_ms: 20,
        reconnect_backoff_secs: 0.05,
        report_interval_secs: 0.05,
        ..Default::default()
    }
}

fn event(rev: usize) -> String {
    format!(
        r#"{{"did":"did:plc:test","kind":"commit","commit":{{"rev":"rev{}","operation":"create","collection":"app.bsky.feed.post"}}}}"#,
        rev
    )
}

/// Memory log that takes a while to acknowledge each record
struct SlowLog {
    inner: MemoryLog,
    delay: Duration,
}

#[async_trait::async_trait]
impl RecordLog for SlowLog {
    async fn append(&self, key: &str, value: &[u8]) -> Result<Ack> {
        tokio::time::sleep(self.delay).await;
        self.inner.append(key, value).await
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    fn describe(&self) -> String {
        "slow".to_string()
    }
}

#[tokio::test]
async fn events_round_trip_into_the_log() {
    init_tracing();
    let (connector, handle) = ChannelConnector::new();
    let log = Arc::new(MemoryLog::new("events", 3));

    for i in 0..100 {
        handle.send_text(event(i));
    }
    handle.finish();

    let pipeline = Pipeline::spawn(&config(1000, 4), connector, log.clone()).unwrap();
    let summary = tokio::time::timeout(Duration::from_secs(10), pipeline.run_until(std::future::pending()))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(summary.outcome, ReceiveOutcome::SourceExhausted);
    assert_eq!(summary.totals.processed, 100);
    assert_eq!(log.len(), 100);

    for i in [0, 42, 99] {
        let stored = log.find(&format!("rev{}", i)).unwrap();
        assert_eq!(stored.value, event(i).into_bytes());
    }
}

#[tokio::test]
async fn emitted_values_keep_the_received_bytes() {
    init_tracing();
    let (connector, handle) = ChannelConnector::new();
    let log = Arc::new(MemoryLog::new("events", 3));

    let sent = r#"{"zeta":1,"commit":{"rev":"a"},"big":123456789012345678901234567890}"#;
    handle.send_text(sent);
    handle.finish();

    let pipeline = Pipeline::spawn(&config(10, 1), connector, log.clone()).unwrap();
    tokio::time::timeout(Duration::from_secs(10), pipeline.run_until(std::future::pending()))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(log.find("a").unwrap().value, sent.as_bytes().to_vec());
}

#[tokio::test]
async fn counters_are_conserved() {
    init_tracing();
    let (connector, handle) = ChannelConnector::new();
    let log = Arc::new(SlowLog { inner: MemoryLog::new("events", 3), delay: Duration::from_micros(200) });
    let pipeline = Pipeline::spawn(&config(50, 2), connector, log).unwrap();

    let feeder = tokio::spawn(async move {
        for i in 0..2000 {
            if i % 10 == 0 {
                handle.send_text("malformed");
            } else {
                handle.send_text(event(i));
            }
            if i % 100 == 0 {
                tokio::task::yield_now().await;
            }
        }
        handle.finish();
    });

    while !pipeline.is_source_exhausted() {
        let snap = pipeline.counters();
        assert!(snap.enqueued + snap.dropped <= snap.received);
        assert!(snap.processed + snap.errors <= snap.enqueued);
        assert!(pipeline.queue_depth() <= 50);
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    feeder.await.unwrap();

    let totals = pipeline.shutdown().await.unwrap().totals;
    assert_eq!(totals.received, 2000);
    assert_eq!(totals.received, totals.enqueued + totals.dropped);
    assert_eq!(totals.enqueued, totals.processed + totals.errors);
    assert_eq!(totals.errors, totals.decode_errors);
}

#[tokio::test]
async fn overflow_without_consumers_sheds_the_excess() {
    init_tracing();
    let (connector, handle) = ChannelConnector::new();
    let log = Arc::new(MemoryLog::new("events", 1));
    let gate = Arc::new(tokio::sync::Semaphore::new(0));

    /// Blocks every append until the test releases it
    struct BlockedLog {
        inner: Arc<MemoryLog>,
        gate: Arc<tokio::sync::Semaphore>,
    }

    #[async_trait::async_trait]
    impl RecordLog for BlockedLog {
        async fn append(&self, key: &str, value: &[u8]) -> Result<Ack> {
            let _permit = self.gate.acquire().await;
            self.inner.append(key, value).await
        }

        async fn flush(&self) -> Result<()> {
            self.inner.flush().await
        }

        fn describe(&self) -> String {
            "blocked".to_string()
        }
    }

    // One worker holds the first frame, so the queue itself sees 15 arrivals at capacity 10
    let blocked = Arc::new(BlockedLog { inner: Arc::clone(&log), gate: Arc::clone(&gate) });
    let pipeline = Pipeline::spawn(&config(10, 1), connector, blocked).unwrap();

    handle.send_text(event(0));
    while pipeline.sink().in_flight() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    for i in 1..=15 {
        handle.send_text(event(i));
    }
    handle.finish();
    while !pipeline.is_source_exhausted() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let snap = pipeline.counters();
    assert_eq!(snap.received, 16);
    assert_eq!(snap.enqueued, 11);
    assert_eq!(snap.dropped, 5);
    assert_eq!(pipeline.queue_depth(), 10);

    gate.add_permits(1000);
    let totals = pipeline.shutdown().await.unwrap().totals;
    assert_eq!(totals.processed, 11);
    assert_eq!(log.len(), 11);
}

#[tokio::test]
async fn reconnect_keeps_workers_and_queued_frames() {
    init_tracing();
    let (connector, handle) = ChannelConnector::new();
    let log = Arc::new(SlowLog { inner: MemoryLog::new("events", 3), delay: Duration::from_millis(2) });

    for i in 0..50 {
        handle.send_text(event(i));
    }
    handle.disconnect("upstream restarted");
    for i in 50..100 {
        handle.send_text(event(i));
    }
    handle.finish();

    let pipeline = Pipeline::spawn(&config(1000, 4), connector, log.clone()).unwrap();
    let summary = tokio::time::timeout(Duration::from_secs(10), pipeline.run_until(std::future::pending()))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(handle.connect_count(), 2);
    assert_eq!(summary.totals.reconnects, 1);
    assert_eq!(summary.totals.dropped, 0);
    assert_eq!(summary.totals.processed, 100);
    assert_eq!(log.inner.len(), 100);

    // The same four workers handled frames from both sessions
    let ids: Vec<usize> = summary.workers.iter().map(|w| w.worker_id).collect();
    assert_eq!(ids, vec![0, 1, 2, 3]);
    assert_eq!(summary.workers.iter().map(|w| w.processed).sum::<u64>(), 100);
}

#[tokio::test]
async fn slow_sink_raises_backpressure_then_recovers() {
    init_tracing();
    let (connector, handle) = ChannelConnector::new();
    let log = Arc::new(SlowLog { inner: MemoryLog::new("events", 3), delay: Duration::from_millis(3) });
    let pipeline = Pipeline::spawn(&config(100, 1), connector, log).unwrap();
    let mut reports = pipeline.reports();

    for i in 0..1000 {
        handle.send_text(event(i));
    }

    let pressured = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let report = reports.next().await.unwrap();
            if report.backpressure {
                return report;
            }
        }
    })
    .await
    .expect("backpressure should be reported");
    assert!(pressured.queue_depth > 50);

    let recovered = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let report = reports.next().await.unwrap();
            if !report.backpressure && report.queue_depth == 0 {
                return report;
            }
        }
    })
    .await
    .expect("queue should drain once intake stops");

    assert!(recovered.totals.dropped > 0);
    assert_eq!(recovered.totals.received, 1000);
    assert_eq!(recovered.totals.received, recovered.totals.enqueued + recovered.totals.dropped);

    handle.finish();
    let summary = pipeline.shutdown().await.unwrap();
    assert!(summary.final_report.is_some());
}

#[tokio::test]
async fn second_flush_is_a_no_op() {
    init_tracing();
    let (connector, handle) = ChannelConnector::new();
    let log = Arc::new(MemoryLog::new("events", 3));
    let pipeline = Pipeline::spawn(&config(100, 2), connector, log.clone()).unwrap();
    let sink = Arc::clone(pipeline.sink());

    for i in 0..10 {
        handle.send_text(event(i));
    }
    handle.finish();

    let summary = pipeline.run_until(std::future::pending()).await.unwrap();
    assert!(summary.flushed);

    assert!(!sink.flush().await.unwrap());
    assert_eq!(log.flush_count(), 1);
    assert_eq!(log.len(), 10);
}

#[tokio::test]
async fn shutdown_signal_drains_an_endless_source() {
    init_tracing();
    let (connector, handle) = ChannelConnector::new();
    let log = Arc::new(MemoryLog::new("events", 3));
    let pipeline = Pipeline::spawn(&config(1000, 4), connector, log.clone()).unwrap();

    for i in 0..20 {
        handle.send_text(event(i));
    }

    let summary = pipeline.run_until(tokio::time::sleep(Duration::from_millis(100))).await.unwrap();
    assert_eq!(summary.outcome, ReceiveOutcome::Cancelled);
    assert_eq!(summary.totals.processed, 20);
    assert_eq!(log.len(), 20);
    assert_eq!(summary.totals.dropped, 0);
}

#[tokio::test]
async fn replay_file_runs_to_completion() {
    init_tracing();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for i in 0..25 {
        writeln!(file, "{}", event(i)).unwrap();
    }
    writeln!(file, "{{\"kind\":\"identity\"}}").unwrap();

    let log = Arc::new(MemoryLog::new("events", 3));
    let pipeline = Pipeline::spawn(&config(1000, 4), ReplayConnector::new(file.path()), log.clone()).unwrap();
    let summary = tokio::time::timeout(Duration::from_secs(10), pipeline.run_until(std::future::pending()))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(summary.outcome, ReceiveOutcome::SourceExhausted);
    assert_eq!(summary.totals.received, 26);
    assert_eq!(summary.totals.processed, 25);
    assert_eq!(summary.totals.decode_errors, 1);
    assert_eq!(log.len(), 25);
}

#[tokio::test]
async fn corrupt_replay_line_is_a_single_decode_error() {
    init_tracing();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "{}", event(1)).unwrap();
    file.write_all(b"{\"commit\":{\"rev\":\"\xff\"}}\n").unwrap();
    writeln!(file, "{}", event(3)).unwrap();

    let log = Arc::new(MemoryLog::new("events", 3));
    let pipeline = Pipeline::spawn(&config(100, 2), ReplayConnector::new(file.path()), log.clone()).unwrap();
    let summary = tokio::time::timeout(Duration::from_secs(10), pipeline.run_until(std::future::pending()))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(summary.outcome, ReceiveOutcome::SourceExhausted);
    assert_eq!(summary.totals.reconnects, 0);
    assert_eq!(summary.totals.received, 3);
    assert_eq!(summary.totals.processed, 2);
    assert_eq!(summary.totals.decode_errors, 1);
    assert_eq!(log.len(), 2);
    assert!(log.find("rev1").is_some());
    assert!(log.find("rev3").is_some());
}
