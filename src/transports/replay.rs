//! Replay transport for recorded streams
//!
//! Reads newline-delimited frames from a file, one frame per line. Lines are
//! handed over as raw bytes, so a corrupt line reaches the workers and is
//! counted like any other malformed frame. Blank lines are skipped. The
//! stream ends at end of file, which lets the pipeline drain and exit instead
//! of waiting for a shutdown signal.
//!
//! The connector remembers how far playback got. If reading fails midway,
//! the next connection resumes after the last complete line instead of
//! starting over.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::time::{Interval, MissedTickBehavior, interval};
use tracing::{debug, info, trace};

use crate::transport::{Connection, Connector};
use crate::types::RawFrame;
use crate::{IngestError, Result};

/// Connector that replays a recorded NDJSON file.
///
/// Clones share the playback position.
#[derive(Debug, Clone)]
pub struct ReplayConnector {
    path: PathBuf,
    rate_hz: Option<f64>,
    position: Arc<AtomicU64>,
}

impl ReplayConnector {
    /// Replay `path` as fast as the pipeline admits frames
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self { path: path.as_ref().to_path_buf(), rate_hz: None, position: Arc::new(AtomicU64::new(0)) }
    }

    /// Pace playback to at most `rate_hz` frames per second.
    ///
    /// Non-positive or non-finite rates disable pacing.
    pub fn with_rate(mut self, rate_hz: f64) -> Self {
        self.rate_hz = (rate_hz.is_finite() && rate_hz > 0.0).then_some(rate_hz);
        self
    }

    /// Replay file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset just past the last line handed out
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }
}

#[async_trait::async_trait]
impl Connector for ReplayConnector {
    type Connection = ReplayConnection;

    async fn connect(&self) -> Result<ReplayConnection> {
        let file_error = |e| IngestError::file_error(self.path.clone(), e);

        let mut file = File::open(&self.path).await.map_err(file_error)?;
        let offset = self.position();
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await.map_err(file_error)?;
        }

        let pacing = self.rate_hz.map(|hz| {
            let mut pacing = interval(Duration::from_secs_f64(1.0 / hz));
            pacing.set_missed_tick_behavior(MissedTickBehavior::Delay);
            pacing
        });

        info!(path = %self.path.display(), offset, rate_hz = ?self.rate_hz, "Opened replay file");

        Ok(ReplayConnection {
            path: self.path.clone(),
            reader: BufReader::new(file),
            position: Arc::clone(&self.position),
            offset,
            pacing,
            frames: 0,
        })
    }

    fn endpoint(&self) -> String {
        format!("replay:{}", self.path.display())
    }
}

/// An open replay file.
pub struct ReplayConnection {
    path: PathBuf,
    reader: BufReader<File>,
    position: Arc<AtomicU64>,
    offset: u64,
    pacing: Option<Interval>,
    frames: u64,
}

#[async_trait::async_trait]
impl Connection for ReplayConnection {
    async fn receive(&mut self) -> Result<Option<RawFrame>> {
        if let Some(pacing) = self.pacing.as_mut() {
            pacing.tick().await;
        }

        loop {
            let mut line = Vec::new();
            let read = self
                .reader
                .read_until(b'\n', &mut line)
                .await
                .map_err(|e| IngestError::file_error(self.path.clone(), e))?;

            if read == 0 {
                debug!(frames = self.frames, offset = self.offset, "Reached end of replay");
                return Ok(None);
            }

            self.offset += read as u64;
            self.position.store(self.offset, Ordering::Release);

            if line.last() == Some(&b'\n') {
                line.pop();
            }
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            self.frames += 1;
            trace!(frame = self.frames, bytes = line.len(), "Replayed frame");
            return Ok(Some(RawFrame::new(line)));
        }
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
