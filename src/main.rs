//! Firehose ingestion daemon
//!
//! # Usage
//!
//! ```bash
//! # Jetstream posts into the local Kafka cluster
//! firehose
//!
//! # Different brokers and topic
//! KAFKA_BROKER=kafka-1:9092,kafka-2:9092 firehose --topic posts
//!
//! # Inspect events without a broker
//! firehose --sink stdout
//!
//! # Replay a capture at 500 frames per second
//! firehose --replay capture.ndjson --replay-rate 500 --sink memory
//!
//! # Verbose logging
//! RUST_LOG=firehose=debug firehose
//! ```
//!
//! # Signals
//!
//! - `SIGINT` / `SIGTERM`: stop receiving, drain the queue, flush, exit

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use firehose::config::{CliArgs, PipelineConfig};
use firehose::pipeline::{Pipeline, connect_log};
use firehose::transports::{ReplayConnector, WebSocketConnector};

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    if let Err(e) = init_tracing(&args.log_level) {
        eprintln!("firehose: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(log_level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(format!("rustls=off,tungstenite=info,{}", log_level))
            .with_context(|| format!("Invalid log level: {}", log_level))?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}

async fn run(args: CliArgs) -> Result<()> {
    let config = PipelineConfig::load(&args).context("Invalid configuration")?;
    info!(sink = %config.sink, queue_capacity = config.queue_capacity, workers = config.workers, "Starting firehose");

    if let Some(path) = &config.replay_file {
        anyhow::ensure!(path.is_file(), "Replay file not found: {}", path.display());
    }

    let log = connect_log(&config)
        .await
        .with_context(|| format!("Failed to open {} sink", config.sink))?;

    let summary = match &config.replay_file {
        Some(path) => {
            let mut connector = ReplayConnector::new(path);
            if let Some(rate) = config.replay_rate_hz {
                connector = connector.with_rate(rate);
            }
            Pipeline::spawn(&config, connector, log)?.run_until(shutdown_signal()).await
        }
        None => {
            let connector = WebSocketConnector::subscribe(&config.upstream_url, &config.wanted_collections)
                .ping_interval(config.ping_interval())
                .ping_timeout(config.ping_timeout());
            Pipeline::spawn(&config, connector, log)?.run_until(shutdown_signal()).await
        }
    }
    .context("Pipeline did not shut down cleanly")?;

    info!(
        processed = summary.totals.processed,
        dropped = summary.totals.dropped,
        errors = summary.totals.errors,
        "Firehose stopped"
    );
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received ctrl-c");
}
