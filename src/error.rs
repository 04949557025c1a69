//! Error types for the logger.
//!
//! Storage failures are described by a single [`StorageError`] carrying the
//! operation that failed ([`StorageOp`]) and a classification
//! ([`StorageErrorKind`]). The narrower types returned by the mount manager
//! and the append file ([`MountError`], [`OpenError`], [`HandleInvalidated`])
//! wrap it so call sites can see which step of the sequence failed.
//!
//! ## Error Hierarchy
//!
//! - **`StorageError`**: anything the storage driver reports. The pipeline maps
//!   every one of these into the `Fault` state; the kind is kept for
//!   diagnostics.
//! - **`FormatOverflowError`**: rendered text did not fit a fixed buffer. Local to
//!   the formatter and never propagated past it by the infallible entry points.
//! - **`ConfigError`**: semantic validation of a loaded configuration.
//! - **`LoggerError`**: application-boundary error used when loading
//!   configuration and opening byte sources.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, LoggerError>;

/// Storage primitive that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageOp {
    /// Device initialization and filesystem recognition.
    Mount,
    /// Release of filesystem state.
    Unmount,
    /// File open or create.
    Open,
    /// Write-position change.
    Seek,
    /// Data write.
    Write,
    /// Shrinking a file back to a known length.
    Truncate,
    /// Commit of buffered data.
    Sync,
    /// Handle release.
    Close,
}

impl std::fmt::Display for StorageOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            StorageOp::Mount => "mount",
            StorageOp::Unmount => "unmount",
            StorageOp::Open => "open",
            StorageOp::Seek => "seek",
            StorageOp::Write => "write",
            StorageOp::Truncate => "truncate",
            StorageOp::Sync => "sync",
            StorageOp::Close => "close",
        };
        write!(f, "{}", label)
    }
}

/// Classification of a storage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// No medium present, or the device did not respond to initialization.
    DeviceAbsent,
    /// The medium is present but carries no recognizable filesystem.
    FilesystemUnrecognized,
    /// A file operation was attempted while the volume was unmounted.
    NotMounted,
    /// The handle does not refer to an open file.
    InvalidHandle,
    /// Fewer bytes were accepted than were submitted.
    ShortWrite,
    /// Low-level I/O failure reported by the driver.
    Io,
}

impl std::fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            StorageErrorKind::DeviceAbsent => "device_absent",
            StorageErrorKind::FilesystemUnrecognized => "filesystem_unrecognized",
            StorageErrorKind::NotMounted => "not_mounted",
            StorageErrorKind::InvalidHandle => "invalid_handle",
            StorageErrorKind::ShortWrite => "short_write",
            StorageErrorKind::Io => "io",
        };
        write!(f, "{}", label)
    }
}

/// Failure reported by a storage driver primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("storage {op} failed ({kind}): {message}")]
pub struct StorageError {
    /// Primitive that failed.
    pub op: StorageOp,
    /// Classification used for diagnostics and recovery decisions.
    pub kind: StorageErrorKind,
    /// Driver-provided detail.
    pub message: String,
}

impl StorageError {
    /// Build an error for `op` with the given classification.
    pub fn new(op: StorageOp, kind: StorageErrorKind, message: impl Into<String>) -> Self {
        Self {
            op,
            kind,
            message: message.into(),
        }
    }

    /// Classify a `std::io::Error` raised while performing `op`.
    pub fn from_io(op: StorageOp, err: &std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound if op == StorageOp::Mount => {
                StorageErrorKind::DeviceAbsent
            }
            std::io::ErrorKind::WriteZero => StorageErrorKind::ShortWrite,
            _ => StorageErrorKind::Io,
        };
        Self::new(op, kind, err.to_string())
    }
}

/// The volume could not be mounted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("mount failed: {0}")]
pub struct MountError(#[from] pub StorageError);

impl MountError {
    /// Classification of the underlying driver error.
    pub fn kind(&self) -> StorageErrorKind {
        self.0.kind
    }
}

/// The log file could not be opened or positioned at end-of-file.
///
/// When the seek fails the file has already been closed; no handle escapes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("open_append failed: {0}")]
pub struct OpenError(#[from] pub StorageError);

/// A write failed and the file handle was closed by the write itself.
///
/// Returned in place of the consumed `AppendFile`, so the caller can no longer
/// reach the invalid handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("file handle invalidated: {cause}")]
pub struct HandleInvalidated {
    /// The write failure.
    pub cause: StorageError,
    /// Failure to cut the file back to its length before the write, if any.
    /// When this is set the partial bytes may still be on the medium.
    pub rollback_error: Option<StorageError>,
    /// Result of the close performed on the caller's behalf.
    pub close_error: Option<StorageError>,
}

/// Rendered text would not fit the fixed-capacity buffer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{what} char limit exceeded: have {capacity}, need {needed} + terminator")]
pub struct FormatOverflowError {
    /// Which rendering overflowed.
    pub what: &'static str,
    /// Buffer capacity in bytes.
    pub capacity: usize,
    /// Bytes the rendering required.
    pub needed: usize,
}

/// Semantic configuration error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("configuration validation error: {0}")]
pub struct ConfigError(pub String);

/// Application-boundary error.
#[derive(Error, Debug)]
pub enum LoggerError {
    /// Configuration file or environment could not be parsed.
    #[error("configuration error: {0}")]
    Figment(#[from] Box<figment::Error>),

    /// Configuration values parsed but are not usable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Byte source could not be opened.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Requested source requires a feature that was not compiled in.
    #[error("Feature '{0}' is not enabled. Rebuild with --features {0}")]
    FeatureNotEnabled(String),
}

impl From<figment::Error> for LoggerError {
    fn from(err: figment::Error) -> Self {
        LoggerError::Figment(Box::new(err))
    }
}
