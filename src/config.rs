//! Pipeline configuration
//!
//! Settings are layered, lowest precedence first: built-in defaults, an
//! optional YAML file, then environment variables and command-line flags.
//!
//! ```rust
//! use firehose::config::{PipelineConfig, SinkKind};
//!
//! let config = PipelineConfig::from_yaml_str("sink: stdout\nworkers: 8\n").unwrap();
//! assert_eq!(config.sink, SinkKind::Stdout);
//! assert_eq!(config.workers, 8);
//! assert_eq!(config.queue_capacity, 10_000);
//! ```

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::KeyPath;
use crate::{IngestError, Result};

pub const DEFAULT_UPSTREAM_URL: &str = "wss://jetstream2.us-west.bsky.network/subscribe";
pub const DEFAULT_COLLECTION: &str = "app.bsky.feed.post";
pub const DEFAULT_BROKERS: &str = "127.0.0.1:19092,127.0.0.1:29092,127.0.0.1:39092";
pub const DEFAULT_TOPIC: &str = "bluesky-events";

/// Downstream log implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Kafka-compatible brokers
    #[default]
    Kafka,
    /// `key<TAB>value` lines on stdout
    Stdout,
    /// In-memory log, discarded at exit
    Memory,
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkKind::Kafka => write!(f, "kafka"),
            SinkKind::Stdout => write!(f, "stdout"),
            SinkKind::Memory => write!(f, "memory"),
        }
    }
}

/// Complete pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// WebSocket endpoint, without the collection filter
    pub upstream_url: String,
    pub wanted_collections: Vec<String>,
    /// Read NDJSON frames from this file instead of the WebSocket
    pub replay_file: Option<PathBuf>,
    /// Replay pacing; unpaced when absent
    pub replay_rate_hz: Option<f64>,

    pub sink: SinkKind,
    /// Comma-separated `host:port` list
    pub brokers: String,
    pub topic: String,
    pub partitions: i32,
    pub replication_factor: i16,
    /// Dotted path of the record key inside each event
    pub key_path: String,

    pub queue_capacity: usize,
    pub workers: usize,
    pub dequeue_timeout_ms: u64,
    pub emit_retry: bool,
    pub emit_timeout_secs: f64,

    pub report_interval_secs: f64,
    pub backpressure_threshold: f64,

    pub reconnect_backoff_secs: f64,
    pub ping_interval_secs: f64,
    pub ping_timeout_secs: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            upstream_url: DEFAULT_UPSTREAM_URL.to_string(),
            wanted_collections: vec![DEFAULT_COLLECTION.to_string()],
            replay_file: None,
            replay_rate_hz: None,
            sink: SinkKind::Kafka,
            brokers: DEFAULT_BROKERS.to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            partitions: 3,
            replication_factor: 3,
            key_path: "commit.rev".to_string(),
            queue_capacity: crate::queue::DEFAULT_CAPACITY,
            workers: crate::workers::DEFAULT_WORKERS,
            dequeue_timeout_ms: 1000,
            emit_retry: true,
            emit_timeout_secs: 30.0,
            report_interval_secs: 10.0,
            backpressure_threshold: 0.5,
            reconnect_backoff_secs: 5.0,
            ping_interval_secs: 20.0,
            ping_timeout_secs: 60.0,
        }
    }
}

/// Command-line flags. Every setting is optional so unset flags fall
/// through to the file and the defaults.
#[derive(Parser, Debug, Default)]
#[command(name = "firehose")]
#[command(author, version, about = "Stream a WebSocket firehose into a partitioned log", long_about = None)]
pub struct CliArgs {
    /// YAML configuration file
    #[arg(short = 'c', long, env = "FIREHOSE_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Upstream WebSocket URL
    #[arg(long, env = "FIREHOSE_UPSTREAM_URL", value_name = "URL")]
    pub upstream_url: Option<String>,

    /// Collections to subscribe to, comma-separated
    #[arg(long, env = "FIREHOSE_WANTED_COLLECTIONS", value_delimiter = ',', value_name = "NSID")]
    pub wanted_collections: Option<Vec<String>>,

    /// Replay NDJSON frames from a file instead of connecting upstream
    #[arg(long, env = "FIREHOSE_REPLAY", value_name = "FILE")]
    pub replay: Option<PathBuf>,

    /// Replay pacing in frames per second
    #[arg(long, value_name = "HZ")]
    pub replay_rate: Option<f64>,

    /// Downstream log
    #[arg(long, value_enum)]
    pub sink: Option<SinkKind>,

    /// Kafka brokers, comma-separated host:port
    #[arg(long, env = "KAFKA_BROKER", value_name = "BROKERS")]
    pub brokers: Option<String>,

    /// Destination topic
    #[arg(long)]
    pub topic: Option<String>,

    /// Partition count used when creating the topic
    #[arg(long)]
    pub partitions: Option<i32>,

    /// Replication factor used when creating the topic
    #[arg(long)]
    pub replication_factor: Option<i16>,

    /// Dotted path of the record key inside each event
    #[arg(long, value_name = "PATH")]
    pub key_path: Option<String>,

    /// Intake queue capacity
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Number of workers
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Seconds between health reports
    #[arg(long, value_name = "SECS")]
    pub report_interval: Option<f64>,

    /// Queue fill ratio that triggers the backpressure warning
    #[arg(long, value_name = "RATIO")]
    pub backpressure_threshold: Option<f64>,

    /// Seconds to wait before reconnecting
    #[arg(long, value_name = "SECS")]
    pub reconnect_backoff: Option<f64>,

    /// Seconds between keepalive pings
    #[arg(long, value_name = "SECS")]
    pub ping_interval: Option<f64>,

    /// Seconds without a pong before the connection is considered dead
    #[arg(long, value_name = "SECS")]
    pub ping_timeout: Option<f64>,

    /// Count emit failures without retrying them
    #[arg(long)]
    pub no_emit_retry: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(short = 'l', long, env = "FIREHOSE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl PipelineConfig {
    /// Defaults, then the YAML file named by `--config`, then flags. Validated.
    pub fn load(args: &CliArgs) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        config.apply_args(args);
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document; missing keys keep their defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml_ng::from_str(yaml).map_err(|e| IngestError::config("config", e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path).map_err(|e| IngestError::file_error(path.to_path_buf(), e))?;
        serde_yaml_ng::from_str(&yaml).map_err(|e| IngestError::config(path.display().to_string(), e.to_string()))
    }

    /// Overlay every flag that was given
    pub fn apply_args(&mut self, args: &CliArgs) {
        if let Some(url) = &args.upstream_url {
            self.upstream_url = url.clone();
        }
        if let Some(collections) = &args.wanted_collections {
            self.wanted_collections = collections.clone();
        }
        if let Some(path) = &args.replay {
            self.replay_file = Some(path.clone());
        }
        if let Some(rate) = args.replay_rate {
            self.replay_rate_hz = Some(rate);
        }
        if let Some(sink) = args.sink {
            self.sink = sink;
        }
        if let Some(brokers) = &args.brokers {
            self.brokers = brokers.clone();
        }
        if let Some(topic) = &args.topic {
            self.topic = topic.clone();
        }
        if let Some(partitions) = args.partitions {
            self.partitions = partitions;
        }
        if let Some(replication) = args.replication_factor {
            self.replication_factor = replication;
        }
        if let Some(key_path) = &args.key_path {
            self.key_path = key_path.clone();
        }
        if let Some(capacity) = args.queue_capacity {
            self.queue_capacity = capacity;
        }
        if let Some(workers) = args.workers {
            self.workers = workers;
        }
        if let Some(secs) = args.report_interval {
            self.report_interval_secs = secs;
        }
        if let Some(threshold) = args.backpressure_threshold {
            self.backpressure_threshold = threshold;
        }
        if let Some(secs) = args.reconnect_backoff {
            self.reconnect_backoff_secs = secs;
        }
        if let Some(secs) = args.ping_interval {
            self.ping_interval_secs = secs;
        }
        if let Some(secs) = args.ping_timeout {
            self.ping_timeout_secs = secs;
        }
        if args.no_emit_retry {
            self.emit_retry = false;
        }
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(IngestError::config("queue_capacity", "must be at least 1"));
        }
        if self.workers == 0 {
            return Err(IngestError::config("workers", "must be at least 1"));
        }
        if self.dequeue_timeout_ms == 0 {
            return Err(IngestError::config("dequeue_timeout_ms", "must be positive"));
        }

        for (key, secs) in [
            ("report_interval_secs", self.report_interval_secs),
            ("reconnect_backoff_secs", self.reconnect_backoff_secs),
            ("ping_interval_secs", self.ping_interval_secs),
            ("ping_timeout_secs", self.ping_timeout_secs),
            ("emit_timeout_secs", self.emit_timeout_secs),
        ] {
            positive_secs(key, secs)?;
        }

        if !(self.backpressure_threshold > 0.0 && self.backpressure_threshold <= 1.0) {
            return Err(IngestError::config("backpressure_threshold", "must be in (0, 1]"));
        }
        if self.ping_timeout_secs < self.ping_interval_secs {
            return Err(IngestError::config("ping_timeout_secs", "must not be shorter than ping_interval_secs"));
        }
        if let Some(rate) = self.replay_rate_hz {
            positive_secs("replay_rate_hz", rate)?;
        }
        if self.replay_file.is_none() && self.upstream_url.trim().is_empty() {
            return Err(IngestError::config("upstream_url", "must not be empty"));
        }

        self.parsed_key_path()?;

        if self.sink == SinkKind::Kafka {
            if self.broker_list().is_empty() {
                return Err(IngestError::config("brokers", "at least one broker is required"));
            }
            if self.topic.trim().is_empty() {
                return Err(IngestError::config("topic", "must not be empty"));
            }
            if self.partitions < 1 {
                return Err(IngestError::config("partitions", "must be at least 1"));
            }
            if self.replication_factor < 1 {
                return Err(IngestError::config("replication_factor", "must be at least 1"));
            }
        }

        Ok(())
    }

    /// Broker addresses with blanks removed
    pub fn broker_list(&self) -> Vec<String> {
        self.brokers.split(',').map(str::trim).filter(|b| !b.is_empty()).map(String::from).collect()
    }

    pub fn parsed_key_path(&self) -> Result<KeyPath> {
        KeyPath::parse(&self.key_path)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        secs_or(self.reconnect_backoff_secs, crate::connector::DEFAULT_RECONNECT_BACKOFF)
    }

    pub fn ping_interval(&self) -> Duration {
        secs_or(self.ping_interval_secs, crate::transports::websocket::DEFAULT_PING_INTERVAL)
    }

    pub fn ping_timeout(&self) -> Duration {
        secs_or(self.ping_timeout_secs, crate::transports::websocket::DEFAULT_PING_TIMEOUT)
    }

    pub fn report_interval(&self) -> Duration {
        secs_or(self.report_interval_secs, crate::health::DEFAULT_REPORT_INTERVAL)
    }

    pub fn emit_timeout(&self) -> Duration {
        secs_or(self.emit_timeout_secs, crate::sink::DEFAULT_EMIT_TIMEOUT)
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }
}

fn positive_secs(key: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(IngestError::config(key, format!("must be a positive number, got {}", value)))
    }
}

fn secs_or(secs: f64, fallback: Duration) -> Duration {
    Duration::try_from_secs_f64(secs).ok().filter(|d| !d.is_zero()).unwrap_or(fallback)
}
