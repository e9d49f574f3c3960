//! Disk-backed job output.
//!
//! Each job gets one append-only file, created owner-read/write only and
//! handed to the child as an already-open descriptor for both stdout and
//! stderr. Readers open their own descriptor and poll for appended bytes.

use std::fs::{DirBuilder, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use uuid::Uuid;

use crate::jobs::JobStatus;

const CHUNK_SIZE: usize = 32 * 1024;

/// Lazy sequence of output chunks. Ends once the job is terminal and every
/// byte has been delivered; dropping it stops the reader.
pub type OutputStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[derive(Debug, Clone)]
pub struct OutputStore {
    dir: PathBuf,
}

impl OutputStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Create the output directory (mode 0700) if needed.
    pub fn init(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let store = Self::new(dir);
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&store.dir)?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn output_path(&self, id: &Uuid) -> PathBuf {
        self.dir.join(format!("{}.log", id))
    }

    /// Create the job's output file and return the writable handle that
    /// becomes the child's stdout and stderr. Fails if the file exists.
    pub fn create_output(&self, id: &Uuid) -> io::Result<File> {
        let path = self.output_path(id);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)?;
        tracing::debug!(job_id = %id, path = %path.display(), "Output file created");
        Ok(file)
    }

    /// Open a cursor at offset 0. `status` tells the cursor when the writer
    /// is gone for good.
    pub async fn open_reader(
        &self,
        id: &Uuid,
        status: watch::Receiver<JobStatus>,
    ) -> io::Result<OutputCursor> {
        let file = tokio::fs::File::open(self.output_path(id)).await?;
        Ok(OutputCursor {
            file,
            offset: 0,
            status,
            buf: vec![0; CHUNK_SIZE],
        })
    }

    pub async fn remove_output(&self, id: &Uuid) -> io::Result<()> {
        match tokio::fs::remove_file(self.output_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Delete the job's output file after `delay`.
    pub fn schedule_removal(&self, id: Uuid, delay: Duration) {
        let store = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match store.remove_output(&id).await {
                Ok(()) => tracing::debug!(job_id = %id, "Output file expired"),
                Err(e) => tracing::warn!(job_id = %id, error = %e, "Failed to remove output file"),
            }
        });
    }
}

/// Result of one cursor read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub data: Bytes,
    /// The job is terminal and nothing was left to read.
    pub is_final: bool,
}

/// Per-consumer read position into one output file.
#[derive(Debug)]
pub struct OutputCursor {
    file: tokio::fs::File,
    offset: u64,
    status: watch::Receiver<JobStatus>,
    buf: Vec<u8>,
}

impl OutputCursor {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read whatever was appended since the last call.
    ///
    /// The job status is sampled before reading: once a terminal job yields
    /// an empty read, every byte its process wrote has been seen.
    pub async fn read_next(&mut self) -> io::Result<Chunk> {
        let terminal = self.status.borrow_and_update().is_terminal();
        let n = self.file.read(&mut self.buf).await?;
        self.offset += n as u64;
        Ok(Chunk {
            data: Bytes::copy_from_slice(&self.buf[..n]),
            is_final: terminal && n == 0,
        })
    }

    /// Sleep for one poll interval, or less if the job status changes.
    pub async fn wait(&mut self, poll_interval: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            changed = self.status.changed() => {
                if changed.is_err() {
                    // Registry entry gone; fall back to plain polling.
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    }

    /// Turn the cursor into a stream fed by a polling task. The task stops
    /// as soon as the consumer drops the stream.
    pub fn into_stream(mut self, job_id: Uuid, poll_interval: Duration) -> OutputStream {
        let (tx, rx) = tokio::sync::mpsc::channel(16);

        tokio::spawn(async move {
            loop {
                let chunk = match self.read_next().await {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, error = %e, "Output read failed");
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                };
                if chunk.is_final {
                    break;
                }
                if !chunk.data.is_empty() {
                    if tx.send(Ok(chunk.data)).await.is_err() {
                        break;
                    }
                    continue;
                }
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = self.wait(poll_interval) => {}
                }
            }
            tracing::debug!(job_id = %job_id, offset = self.offset, "Output stream finished");
        });

        Box::pin(ReceiverStream::new(rx))
    }
}

/// A stream that ends immediately, for jobs that never produced output.
pub fn empty_stream() -> OutputStream {
    Box::pin(tokio_stream::empty::<io::Result<Bytes>>())
}
