//! Transfer state machine for chunked file uploads and downloads.
//!
//! One [`Transfer`] exists per connection and direction. It moves through
//! `Idle → Active → Idle` on success and `Idle → Active → Aborting → Idle`
//! when a chunk is rejected, the upload times out, or the connection drops.
//! Bytes land in a [`TransferSink`]; aborting discards the sink together
//! with any file it created.

use crate::error::{TransferError, ValidationError};
use crate::{MAX_CHUNK_SIZE, MAX_FILE_SIZE, UPLOAD_TIMEOUT};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Append-only destination for transferred bytes
pub trait TransferSink: Send + Sized {
    /// What a finished sink yields
    type Output: Send;

    /// Append bytes at the end
    fn append(&mut self, bytes: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// Flush and close, yielding the result
    fn finish(self) -> impl Future<Output = io::Result<Self::Output>> + Send;

    /// Close and remove every trace of the partial data
    fn discard(self) -> impl Future<Output = io::Result<()>> + Send;
}

/// Sink writing to a file on disk
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: File,
}

impl FileSink {
    /// Create (or truncate) the file at `path`
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened for writing.
    pub async fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = File::create(&path).await?;
        Ok(Self { path, file })
    }

    /// Create the file at `path`, failing if it already exists
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists or cannot be created.
    pub async fn create_new(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        Ok(Self { path, file })
    }

    /// Location of the file being written
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl TransferSink for FileSink {
    type Output = PathBuf;

    async fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes).await
    }

    async fn finish(mut self) -> io::Result<PathBuf> {
        if let Err(e) = self.file.flush().await {
            drop(self.file);
            let _ = remove_if_exists(&self.path).await;
            return Err(e);
        }
        Ok(self.path)
    }

    async fn discard(mut self) -> io::Result<()> {
        // Let in-flight writes land before unlinking
        let _ = self.file.flush().await;
        drop(self.file);
        remove_if_exists(&self.path).await
    }
}

/// Sink collecting bytes in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    buf: Vec<u8>,
}

impl MemorySink {
    /// Create an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransferSink for MemorySink {
    type Output = Vec<u8>;

    async fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    async fn finish(self) -> io::Result<Vec<u8>> {
        Ok(self.buf)
    }

    async fn discard(self) -> io::Result<()> {
        Ok(())
    }
}

/// Bounds applied to a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLimits {
    /// Largest accepted declared size
    pub max_file_size: u64,
    /// Largest accepted chunk
    pub max_chunk_size: usize,
    /// Time allowed from start to last chunk (`None` = unbounded)
    pub timeout: Option<Duration>,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self::upload()
    }
}

impl TransferLimits {
    /// Limits for server-side uploads
    #[must_use]
    pub fn upload() -> Self {
        Self {
            max_file_size: MAX_FILE_SIZE,
            max_chunk_size: MAX_CHUNK_SIZE,
            timeout: Some(UPLOAD_TIMEOUT),
        }
    }

    /// Limits for client-side downloads (not time-bounded)
    #[must_use]
    pub fn download() -> Self {
        Self {
            timeout: None,
            ..Self::upload()
        }
    }
}

/// Observable transfer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// No transfer in progress
    Idle,
    /// Receiving chunks
    Active,
    /// Discarding a failed transfer
    Aborting,
}

/// Progress after an accepted chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    /// Bytes received so far
    pub transferred: u64,
    /// Declared total
    pub expected: u64,
}

impl ChunkProgress {
    /// Completion in whole percent (0-100)
    #[must_use]
    pub fn percent(&self) -> u8 {
        if self.expected == 0 {
            return 100;
        }
        ((u128::from(self.transferred) * 100) / u128::from(self.expected)).min(100) as u8
    }
}

/// Outcome of a completed transfer
#[derive(Debug)]
pub struct CompletedTransfer<T> {
    /// Sanitized file name
    pub file_name: String,
    /// Declared size
    pub expected_size: u64,
    /// Bytes actually received
    pub transferred: u64,
    /// Time from start to completion
    pub elapsed: Duration,
    /// Sink result (path or bytes)
    pub output: T,
}

impl<T> CompletedTransfer<T> {
    /// Whether the received byte count matches the declared size
    #[must_use]
    pub fn size_matches(&self) -> bool {
        self.transferred == self.expected_size
    }
}

#[derive(Debug)]
struct ActiveTransfer<S> {
    file_name: String,
    expected_size: u64,
    transferred: u64,
    started_at: Instant,
    sink: S,
}

#[derive(Debug)]
enum Slot<S> {
    Idle,
    Active(ActiveTransfer<S>),
    Aborting,
}

/// Per-connection transfer state machine
#[derive(Debug)]
pub struct Transfer<S> {
    slot: Slot<S>,
    limits: TransferLimits,
}

impl<S: TransferSink> Transfer<S> {
    /// Create an idle transfer with the given limits
    #[must_use]
    pub fn new(limits: TransferLimits) -> Self {
        Self {
            slot: Slot::Idle,
            limits,
        }
    }

    /// Configured limits
    #[must_use]
    pub fn limits(&self) -> &TransferLimits {
        &self.limits
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> TransferState {
        match self.slot {
            Slot::Idle => TransferState::Idle,
            Slot::Active(_) => TransferState::Active,
            Slot::Aborting => TransferState::Aborting,
        }
    }

    /// Whether chunks are currently accepted
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self.slot, Slot::Active(_))
    }

    /// Name of the active transfer
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        match &self.slot {
            Slot::Active(active) => Some(&active.file_name),
            _ => None,
        }
    }

    /// Progress of the active transfer
    #[must_use]
    pub fn progress(&self) -> Option<ChunkProgress> {
        match &self.slot {
            Slot::Active(active) => Some(ChunkProgress {
                transferred: active.transferred,
                expected: active.expected_size,
            }),
            _ => None,
        }
    }

    /// Whether the active transfer has outlived its timeout
    #[must_use]
    pub fn is_timed_out(&self) -> bool {
        match &self.slot {
            Slot::Active(active) => self
                .limits
                .timeout
                .is_some_and(|timeout| active.started_at.elapsed() > timeout),
            _ => false,
        }
    }

    /// Validate a start request and sanitize its name
    ///
    /// Runs before any sink is opened, so a rejected start leaves nothing
    /// behind.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidFileSize`] if `expected_size` is not
    /// in `1..=max_file_size`.
    pub fn prepare(
        &self,
        raw_name: &str,
        expected_size: i64,
    ) -> Result<(String, u64), ValidationError> {
        let invalid = ValidationError::InvalidFileSize {
            size: expected_size,
            max: self.limits.max_file_size,
        };
        let size = u64::try_from(expected_size).map_err(|_| invalid.clone())?;
        if size == 0 || size > self.limits.max_file_size {
            return Err(invalid);
        }
        Ok((crate::name::sanitize_file_name(raw_name), size))
    }

    /// Activate a transfer writing into `sink`
    ///
    /// An already active transfer is aborted and replaced.
    ///
    /// # Errors
    ///
    /// Returns a validation error (and discards `sink`) if `expected_size` is
    /// out of range.
    pub async fn start(
        &mut self,
        file_name: String,
        expected_size: u64,
        sink: S,
    ) -> Result<(), TransferError> {
        if expected_size == 0 || expected_size > self.limits.max_file_size {
            let _ = sink.discard().await;
            return Err(ValidationError::InvalidFileSize {
                size: i64::try_from(expected_size).unwrap_or(i64::MAX),
                max: self.limits.max_file_size,
            }
            .into());
        }

        if self.is_active() {
            self.abort("replaced by a new transfer").await;
        }

        debug!(file = %file_name, expected_size, "transfer started");
        self.slot = Slot::Active(ActiveTransfer {
            file_name,
            expected_size,
            transferred: 0,
            started_at: Instant::now(),
            sink,
        });
        Ok(())
    }

    /// Accept one chunk
    ///
    /// # Errors
    ///
    /// - [`ValidationError::InvalidChunkSize`] for empty or oversized chunks
    /// - [`ValidationError::NoActiveTransfer`] when idle
    /// - [`TransferError::Timeout`] past the time limit (aborts)
    /// - [`ValidationError::SizeExceeded`] past the declared size (aborts)
    /// - [`TransferError::Io`] if the sink fails (aborts)
    pub async fn chunk(&mut self, bytes: &[u8]) -> Result<ChunkProgress, TransferError> {
        if bytes.is_empty() || bytes.len() > self.limits.max_chunk_size {
            return Err(ValidationError::InvalidChunkSize {
                size: bytes.len() as i64,
                max: self.limits.max_chunk_size,
            }
            .into());
        }

        let Slot::Active(active) = &mut self.slot else {
            return Err(ValidationError::NoActiveTransfer.into());
        };

        let elapsed = active.started_at.elapsed();
        if self.limits.timeout.is_some_and(|timeout| elapsed > timeout) {
            self.abort("timed out").await;
            return Err(TransferError::Timeout { elapsed });
        }

        let expected = active.expected_size;
        let received = active.transferred + bytes.len() as u64;
        if received > expected {
            self.abort("declared size exceeded").await;
            return Err(ValidationError::SizeExceeded { expected, received }.into());
        }

        let appended = active.sink.append(bytes).await;
        if let Err(e) = appended {
            self.abort("sink write failed").await;
            return Err(e.into());
        }
        active.transferred = received;

        Ok(ChunkProgress {
            transferred: received,
            expected,
        })
    }

    /// Finish the active transfer
    ///
    /// A byte count that differs from the declared size is logged, not
    /// rejected.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::NoActiveTransfer`] when idle, or an I/O
    /// error if the sink cannot be finalized.
    pub async fn complete(&mut self) -> Result<CompletedTransfer<S::Output>, TransferError> {
        let active = match std::mem::replace(&mut self.slot, Slot::Idle) {
            Slot::Active(active) => active,
            _ => return Err(ValidationError::NoActiveTransfer.into()),
        };

        if active.transferred != active.expected_size {
            warn!(
                file = %active.file_name,
                expected = active.expected_size,
                received = active.transferred,
                "transfer completed with size mismatch"
            );
        }

        let elapsed = active.started_at.elapsed();
        let output = active.sink.finish().await?;

        Ok(CompletedTransfer {
            file_name: active.file_name,
            expected_size: active.expected_size,
            transferred: active.transferred,
            elapsed,
            output,
        })
    }

    /// Discard the active transfer and return to idle
    ///
    /// Returns the aborted file name, or `None` if nothing was active.
    pub async fn abort(&mut self, reason: &str) -> Option<String> {
        let active = match std::mem::replace(&mut self.slot, Slot::Aborting) {
            Slot::Active(active) => active,
            _ => {
                self.slot = Slot::Idle;
                return None;
            }
        };

        warn!(
            file = %active.file_name,
            received = active.transferred,
            expected = active.expected_size,
            reason,
            "transfer aborted"
        );
        if let Err(e) = active.sink.discard().await {
            warn!(file = %active.file_name, "failed to discard partial data: {e}");
        }

        self.slot = Slot::Idle;
        Some(active.file_name)
    }
}
