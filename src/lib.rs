//! Resilient streaming ingestion from a WebSocket firehose into a partitioned log.
//!
//! Firehose keeps a long-lived upstream connection open, admits every frame
//! into a bounded queue without ever blocking the receive path, and lets a
//! fixed pool of workers decode and emit keyed records to an append log.
//!
//! # Features
//!
//! - **Self-healing transport**: connection loss triggers a fixed backoff and reconnect
//! - **Load shedding**: a full queue drops frames and counts them instead of stalling
//! - **Fault isolation**: decode errors, emit errors and panics stay local to one frame
//! - **Observability**: lock-free stage counters and periodic health reports
//! - **Graceful drain**: shutdown empties the queue and flushes the sink exactly once
//!
//! # Architecture
//!
//! ```text
//! Connector -> ReceiveLoop -> BoundedQueue -> WorkerPool (N) -> EgressSink -> RecordLog
//!                                  ^                                 |
//!                          HealthMonitor (reads counters and queue depth)
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use firehose::config::PipelineConfig;
//! use firehose::sink::MemoryLog;
//! use firehose::transports::WebSocketConnector;
//! use firehose::Pipeline;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::default();
//!     let connector = WebSocketConnector::subscribe(&config.upstream_url, &config.wanted_collections);
//!     let log = Arc::new(MemoryLog::new("bluesky-events", 3));
//!
//!     let pipeline = Pipeline::spawn(&config, connector, log.clone())?;
//!     let summary = pipeline
//!         .run_until(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!
//!     println!("processed {} events, {} stored", summary.totals.processed, log.len());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connector;
pub mod counters;
mod error;
pub mod health;
pub mod pipeline;
pub mod queue;
pub mod receiver;
pub mod sink;
pub mod transport;
pub mod transports;
pub mod types;
pub mod workers;

// Core exports
pub use counters::{CountersSnapshot, StageCounters};
pub use error::*;
pub use health::HealthReport;
pub use pipeline::{Pipeline, ShutdownSummary};
pub use queue::BoundedQueue;
pub use transport::{Connection, Connector};
pub use types::*;
