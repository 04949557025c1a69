//! Storage access for the log target.
//!
//! The layers, leaf-first:
//!
//! - [`StorageDriver`]: the primitives a block-device filesystem exposes
//!   (mount, open, seek, write, truncate, sync, close). Each returns a [`StorageError`]
//!   on failure.
//! - [`Volume`]: the mount manager. Owns the driver and tracks whether the
//!   filesystem is mounted.
//! - [`AppendFile`]: an open file positioned at end-of-file with a monotonic
//!   write offset.
//!
//! Drivers:
//!
//! - [`FatDriver`] runs the FAT filesystem itself on a raw block device or a
//!   card image.
//! - [`DirectoryDriver`] uses a medium the operating system has already
//!   mounted at a directory.
//! - [`MockCard`] is an in-memory card with fault injection, used by tests and
//!   by `--simulate` runs.

pub mod append_file;
pub mod dir;
pub mod fat;
pub mod mock;
pub mod volume;

pub use append_file::AppendFile;
pub use dir::DirectoryDriver;
pub use fat::{create_fat16_image, FatDriver, FatHandle, FixedClock, ImageDevice};
pub use mock::{CardCounters, MockCard};
pub use volume::{MountState, Volume};

use crate::error::StorageError;

/// Filesystem primitives on a block device.
///
/// Implementations report every failure through `Err`; there is no
/// distinguished success status to check. File operations on an unmounted
/// filesystem must fail with `StorageErrorKind::NotMounted`.
pub trait StorageDriver {
    /// Open-file token handed back to the driver for every file operation.
    type Handle;

    /// Initialize the device and recognize its filesystem.
    fn mount(&mut self) -> Result<(), StorageError>;

    /// Release filesystem state. Open handles become invalid.
    fn unmount(&mut self) -> Result<(), StorageError>;

    /// Open `path` for writing, creating it if absent. Never truncates.
    fn open(&mut self, path: &str) -> Result<Self::Handle, StorageError>;

    /// Current size of the file in bytes.
    fn file_size(&mut self, handle: &Self::Handle) -> Result<u64, StorageError>;

    /// Move the write position to `pos` bytes from the start.
    fn seek(&mut self, handle: &mut Self::Handle, pos: u64) -> Result<(), StorageError>;

    /// Write `bytes` at the current position and return how many were accepted.
    fn write(&mut self, handle: &mut Self::Handle, bytes: &[u8]) -> Result<usize, StorageError>;

    /// Cut the file back to `len` bytes and leave the write position there.
    ///
    /// Used to undo the accepted prefix of a failed write.
    fn truncate(&mut self, handle: &mut Self::Handle, len: u64) -> Result<(), StorageError>;

    /// Commit buffered data for this file to the medium.
    fn sync(&mut self, handle: &mut Self::Handle) -> Result<(), StorageError>;

    /// Flush and release the handle.
    fn close(&mut self, handle: Self::Handle) -> Result<(), StorageError>;
}
