//! # Flight Logger
//!
//! An always-running logger for a flight computer. It drains console bytes
//! from a byte source and appends them to a log file on a removable SD card,
//! keeping the file durable with periodic syncs and recovering from card
//! faults without ever stopping.
//!
//! ## Crate Structure
//!
//! - **`storage`**: The `StorageDriver` seam, the mount manager (`Volume`), the
//!   append-mode file handle (`AppendFile`) and the drivers: FAT on a raw
//!   block device, an OS-mounted card directory, and a simulated card.
//! - **`recovery`**: The `Healthy`/`Fault`/`Recovering` state machine and its
//!   retry policy.
//! - **`pipeline`**: `LoggerSession`, the owned state of the logging task and
//!   its read/write/sync loop.
//! - **`telemetry`**: Telemetry records and their fixed-capacity filename and
//!   CSV-line formatting.
//! - **`indicator`**: Fire-and-forget status signals.
//! - **`source`**: Opening stdin, file or serial byte sources.
//! - **`config`** / **`logging`**: Figment configuration and tracing setup.
//! - **`error`**: Error types.

pub mod config;
pub mod error;
pub mod indicator;
pub mod logging;
pub mod pipeline;
pub mod recovery;
pub mod source;
pub mod storage;
pub mod telemetry;

pub use error::{LoggerError, StorageError, StorageErrorKind, StorageOp};
pub use pipeline::{ChunkOutcome, LoggerSession, RunSummary, SessionOptions};
pub use recovery::{RecoveryState, RetryPolicy};
