//! The write/sync pipeline.
//!
//! [`LoggerSession`] is the single owner of everything the logging task needs:
//! the volume, the open log file, the recovery machine, the sync counter and
//! the statistics. [`LoggerSession::run`] is the main loop and never ends on
//! its own; [`LoggerSession::run_until`] adds a stop condition, and the
//! session can also be driven chunk by chunk with
//! [`LoggerSession::process_chunk`].
//!
//! # Example
//!
//! ```no_run
//! use flight_logger::pipeline::{LoggerSession, SessionOptions};
//! use flight_logger::storage::DirectoryDriver;
//! use flight_logger::indicator::TracingIndicator;
//!
//! # async fn demo() {
//! let mut session = LoggerSession::start(
//!     DirectoryDriver::new("/mnt/sd"),
//!     SessionOptions::default(),
//!     TracingIndicator,
//! );
//! let mut console = tokio::io::stdin();
//! let summary = session
//!     .run_until(&mut console, |stats| stats.bytes_written >= 1 << 20)
//!     .await;
//! println!("{} bytes logged", summary.stats.bytes_written);
//! # }
//! ```

use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{sleep, Instant};

use crate::error::{StorageError, StorageErrorKind, StorageOp};
use crate::indicator::{StatusEvent, StatusIndicator};
use crate::recovery::{RecoveryMachine, RecoveryState, RecoveryStats, RetryPolicy};
use crate::storage::{AppendFile, StorageDriver, Volume};

/// Default bytes per read from the byte source.
pub const DEFAULT_CHUNK_SIZE: usize = 128;
/// Largest supported chunk; the read buffer is this size.
pub const MAX_CHUNK_SIZE: usize = 512;
/// Default number of successful writes between durability syncs.
pub const DEFAULT_SYNC_INTERVAL: u16 = 20;
/// Default log file path on the volume.
pub const DEFAULT_LOG_PATH: &str = "data.txt";

/// Session parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Log file path relative to the volume root.
    pub log_path: String,
    /// Bytes per read, at most [`MAX_CHUNK_SIZE`].
    pub chunk_size: usize,
    /// Successful writes between syncs, at least 1.
    pub sync_interval: u16,
    /// Pacing of remount attempts. Its settle delay also paces idle reads.
    pub retry: RetryPolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            log_path: DEFAULT_LOG_PATH.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            retry: RetryPolicy::default(),
        }
    }
}

/// Pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Non-empty chunks received from the source.
    pub chunks_read: u64,
    /// Chunks appended to the log.
    pub chunks_written: u64,
    /// Bytes appended to the log.
    pub bytes_written: u64,
    /// Chunks discarded because storage was unhealthy or the write failed.
    pub chunks_dropped: u64,
    /// Bytes in discarded chunks.
    pub bytes_dropped: u64,
    /// Successful durability syncs.
    pub syncs: u64,
    /// Failed syncs. Each one is also a storage fault.
    pub sync_failures: u64,
    /// Reads that failed with an error from the source.
    pub read_errors: u64,
    /// Reads that returned no bytes.
    pub idle_reads: u64,
}

/// What happened to one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Appended to the log; `synced` when this write completed a sync interval.
    Written { synced: bool },
    /// Discarded. Storage was unhealthy or the write failed.
    Dropped,
    /// Nothing to do.
    Empty,
}

/// Snapshot returned when a run ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Pipeline counters.
    pub stats: PipelineStats,
    /// Recovery counters and last error.
    pub recovery: RecoveryStats,
    /// Storage health when the snapshot was taken.
    pub state: RecoveryState,
    /// Offset of the next write, if the log file is open.
    pub file_offset: Option<u64>,
}

/// Exclusively owned state of the logging task.
pub struct LoggerSession<D: StorageDriver, I: StatusIndicator> {
    volume: Volume<D>,
    file: Option<AppendFile<D::Handle>>,
    log_path: String,
    chunk_size: usize,
    sync_interval: u16,
    write_count: u16,
    recovery: RecoveryMachine,
    indicator: I,
    stats: PipelineStats,
}

impl<D: StorageDriver, I: StatusIndicator> LoggerSession<D, I> {
    /// Mount the volume and open the log for append.
    ///
    /// Never fails: if storage is unavailable the session starts in `Fault`
    /// and recovers as input arrives.
    pub fn start(driver: D, options: SessionOptions, indicator: I) -> Self {
        let mut session = Self {
            volume: Volume::new(driver),
            file: None,
            log_path: options.log_path,
            chunk_size: options.chunk_size.clamp(1, MAX_CHUNK_SIZE),
            sync_interval: options.sync_interval.max(1),
            write_count: 0,
            recovery: RecoveryMachine::new(options.retry),
            indicator,
            stats: PipelineStats::default(),
        };

        let opened = session
            .volume
            .mount()
            .map_err(|e| e.0)
            .and_then(|()| {
                AppendFile::open_append(&mut session.volume, &session.log_path).map_err(|e| e.0)
            });

        match opened {
            Ok(file) => {
                tracing::info!(
                    path = %session.log_path,
                    offset = file.offset(),
                    "Logging session started"
                );
                session.file = Some(file);
            }
            Err(err) => session.recovery.fault(err),
        }
        session
    }

    /// Current storage health.
    pub fn state(&self) -> RecoveryState {
        self.recovery.state()
    }

    /// Pipeline counters so far.
    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// The recovery machine, for its stats and hold-off.
    pub fn recovery(&self) -> &RecoveryMachine {
        &self.recovery
    }

    /// The mount manager.
    pub fn volume(&self) -> &Volume<D> {
        &self.volume
    }

    /// Log file path relative to the volume root.
    pub fn log_path(&self) -> &str {
        &self.log_path
    }

    /// Successful writes since the last sync. Not reset by recovery.
    pub fn write_count(&self) -> u16 {
        self.write_count
    }

    /// Offset of the next write, if the log file is open.
    pub fn file_offset(&self) -> Option<u64> {
        self.file.as_ref().map(AppendFile::offset)
    }

    /// Snapshot of counters and state.
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            stats: self.stats,
            recovery: self.recovery.stats().clone(),
            state: self.recovery.state(),
            file_offset: self.file_offset(),
        }
    }

    /// Handle one chunk from the byte source.
    ///
    /// While unhealthy the chunk is discarded and at most one recovery attempt
    /// is made. While healthy the chunk is appended; every `sync_interval`-th
    /// successful write is followed by a durability sync.
    pub async fn process_chunk(&mut self, chunk: &[u8]) -> ChunkOutcome {
        if chunk.is_empty() {
            return ChunkOutcome::Empty;
        }
        self.stats.chunks_read += 1;

        if !self.recovery.is_healthy() {
            self.indicator.signal(StatusEvent::Fault);
            if self.recovery.ready(Instant::now()) {
                self.indicator.signal(StatusEvent::Recovering);
            }
            self.recovery
                .recover(&mut self.volume, &mut self.file, &self.log_path)
                .await;
            return self.drop_chunk(chunk);
        }

        self.indicator.signal(StatusEvent::Writing);
        let Some(file) = self.file.take() else {
            self.recovery.fault(StorageError::new(
                StorageOp::Write,
                StorageErrorKind::InvalidHandle,
                "no open log file",
            ));
            return self.drop_chunk(chunk);
        };

        match file.write(&mut self.volume, chunk) {
            Ok(file) => {
                self.file = Some(file);
                self.stats.chunks_written += 1;
                self.stats.bytes_written += chunk.len() as u64;
                self.indicator.signal(StatusEvent::Written);
                let synced = self.count_write();
                ChunkOutcome::Written { synced }
            }
            Err(invalidated) => {
                if invalidated.rollback_error.is_some() {
                    tracing::warn!(
                        path = %self.log_path,
                        "Log may hold a partial chunk from the failed write"
                    );
                }
                if let Some(close_err) = &invalidated.close_error {
                    tracing::debug!(%close_err, "Close after failed write also failed");
                }
                self.recovery.fault(invalidated.cause);
                self.drop_chunk(chunk)
            }
        }
    }

    /// Advance the write counter and sync on wrap. Returns whether a sync
    /// succeeded.
    fn count_write(&mut self) -> bool {
        self.write_count = (self.write_count + 1) % self.sync_interval;
        if self.write_count != 0 {
            return false;
        }

        let Some(file) = self.file.as_mut() else {
            return false;
        };
        match file.sync(&mut self.volume) {
            Ok(()) => {
                self.stats.syncs += 1;
                tracing::trace!(offset = file.offset(), "Log synced");
                true
            }
            Err(err) => {
                self.stats.sync_failures += 1;
                self.recovery.fault(err);
                false
            }
        }
    }

    fn drop_chunk(&mut self, chunk: &[u8]) -> ChunkOutcome {
        self.stats.chunks_dropped += 1;
        self.stats.bytes_dropped += chunk.len() as u64;
        ChunkOutcome::Dropped
    }

    /// Drain `source` in fixed-size chunks for the life of the process.
    ///
    /// A read that returns no bytes means the source is idle for now, not
    /// finished: the loop waits the settle delay and reads again. A pipe whose
    /// writer went away or a file that has not grown yet is picked up again
    /// as soon as data appears. Read errors are counted and paced the same
    /// way.
    pub async fn run<R>(&mut self, source: &mut R) -> RunSummary
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.run_until(source, |_| false).await
    }

    /// [`run`](Self::run) with a stop condition, checked against the counters
    /// before every read.
    pub async fn run_until<R, F>(&mut self, source: &mut R, mut stop: F) -> RunSummary
    where
        R: AsyncRead + Unpin + ?Sized,
        F: FnMut(&PipelineStats) -> bool,
    {
        let mut buffer = [0u8; MAX_CHUNK_SIZE];
        let chunk_size = self.chunk_size;
        let idle_delay = self.recovery.policy().settle_delay;

        while !stop(&self.stats) {
            match source.read(&mut buffer[..chunk_size]).await {
                Ok(0) => {
                    self.stats.idle_reads += 1;
                    if self.stats.idle_reads == 1 {
                        tracing::debug!("Byte source idle, polling");
                    }
                    sleep(idle_delay).await;
                }
                Ok(n) => {
                    self.process_chunk(&buffer[..n]).await;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.stats.read_errors += 1;
                    tracing::warn!(%err, "Byte source read failed");
                    sleep(idle_delay).await;
                }
            }
        }

        let summary = self.summary();
        tracing::info!(
            bytes_written = summary.stats.bytes_written,
            bytes_dropped = summary.stats.bytes_dropped,
            syncs = summary.stats.syncs,
            faults = summary.recovery.faults,
            recoveries = summary.recovery.recoveries,
            state = %summary.state,
            "Logging run stopped"
        );
        summary
    }

    /// Close the log file and unmount. Closing commits pending data.
    pub fn close(mut self) -> RunSummary {
        if let Some(file) = self.file.take() {
            if let Err(err) = file.close(&mut self.volume) {
                tracing::warn!(%err, "Closing log file failed");
            }
        }
        self.volume.unmount();
        self.summary()
    }
}

impl<D: StorageDriver, I: StatusIndicator> std::fmt::Debug for LoggerSession<D, I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggerSession")
            .field("log_path", &self.log_path)
            .field("state", &self.recovery.state())
            .field("write_count", &self.write_count)
            .field("file_offset", &self.file_offset())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
