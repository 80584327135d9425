//! Line-oriented log on standard output

use std::io;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter, Stdout};
use tokio::sync::Mutex;

use super::{Ack, RecordLog};
use crate::{IngestError, Result};

/// Writes each record as one `key<TAB>value` line.
///
/// Every record lands in partition 0 with a running offset. A line is staged
/// whole and its remainder is written before anything else if an append is
/// abandoned midway, so lines never interleave or tear.
pub struct StdoutLog<W = Stdout> {
    output: Mutex<Output<W>>,
    next_offset: AtomicI64,
}

struct Output<W> {
    writer: BufWriter<W>,
    staged: Vec<u8>,
    written: usize,
}

impl<W: AsyncWrite + Unpin> Output<W> {
    async fn write_staged(&mut self) -> io::Result<()> {
        while self.written < self.staged.len() {
            let n = self.writer.write(&self.staged[self.written..]).await?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            self.written += n;
        }
        self.staged.clear();
        self.written = 0;
        Ok(())
    }
}

impl StdoutLog<Stdout> {
    pub fn new() -> Self {
        Self::with_writer(tokio::io::stdout())
    }
}

impl Default for StdoutLog<Stdout> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: AsyncWrite + Unpin + Send> StdoutLog<W> {
    /// Write records to `writer` instead of stdout
    pub fn with_writer(writer: W) -> Self {
        Self {
            output: Mutex::new(Output { writer: BufWriter::new(writer), staged: Vec::new(), written: 0 }),
            next_offset: AtomicI64::new(0),
        }
    }

    /// Unwrap the underlying writer
    pub fn into_inner(self) -> W {
        self.output.into_inner().writer.into_inner()
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> RecordLog for StdoutLog<W> {
    async fn append(&self, key: &str, value: &[u8]) -> Result<Ack> {
        let mut output = self.output.lock().await;
        let write_failed = |e: io::Error| IngestError::emit_with_source("stdout", "write failed", Box::new(e));

        // Finish a line whose append was abandoned
        output.write_staged().await.map_err(write_failed)?;

        output.staged.reserve(key.len() + value.len() + 2);
        output.staged.extend_from_slice(key.as_bytes());
        output.staged.push(b'\t');
        output.staged.extend_from_slice(value);
        output.staged.push(b'\n');
        output.write_staged().await.map_err(write_failed)?;

        let offset = self.next_offset.fetch_add(1, Ordering::AcqRel);
        Ok(Ack { partition: 0, offset })
    }

    async fn flush(&self) -> Result<()> {
        let mut output = self.output.lock().await;
        let flush = async {
            output.write_staged().await?;
            output.writer.flush().await
        };
        flush.await.map_err(|e| IngestError::emit_with_source("stdout", "flush failed", Box::new(e)))
    }

    fn describe(&self) -> String {
        "stdout".to_string()
    }
}
