//! Driver for a medium already mounted by the operating system.
//!
//! On a Linux flight computer the SD card's FAT partition is mounted at a
//! fixed directory. "Mounting" here means verifying the directory is present
//! and usable; it is how the logger notices the card has gone away and come
//! back.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::StorageDriver;
use crate::error::{StorageError, StorageErrorKind, StorageOp};

/// Files under a directory on an OS-mounted volume.
#[derive(Debug)]
pub struct DirectoryDriver {
    root: PathBuf,
    mounted: bool,
}

impl DirectoryDriver {
    /// Driver for files under `root`. Nothing is touched until mount.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mounted: false,
        }
    }

    /// Directory the card is expected to be mounted at.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn require_mounted(&self, op: StorageOp) -> Result<(), StorageError> {
        if self.mounted {
            Ok(())
        } else {
            Err(StorageError::new(
                op,
                StorageErrorKind::NotMounted,
                format!("{} is not mounted", self.root.display()),
            ))
        }
    }
}

impl StorageDriver for DirectoryDriver {
    type Handle = File;

    fn mount(&mut self) -> Result<(), StorageError> {
        let metadata =
            fs::metadata(&self.root).map_err(|e| StorageError::from_io(StorageOp::Mount, &e))?;
        if !metadata.is_dir() {
            return Err(StorageError::new(
                StorageOp::Mount,
                StorageErrorKind::FilesystemUnrecognized,
                format!("{} is not a directory", self.root.display()),
            ));
        }
        self.mounted = true;
        Ok(())
    }

    fn unmount(&mut self) -> Result<(), StorageError> {
        self.mounted = false;
        Ok(())
    }

    fn open(&mut self, path: &str) -> Result<File, StorageError> {
        self.require_mounted(StorageOp::Open)?;
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.root.join(path))
            .map_err(|e| StorageError::from_io(StorageOp::Open, &e))
    }

    fn file_size(&mut self, handle: &File) -> Result<u64, StorageError> {
        handle
            .metadata()
            .map(|m| m.len())
            .map_err(|e| StorageError::from_io(StorageOp::Seek, &e))
    }

    fn seek(&mut self, handle: &mut File, pos: u64) -> Result<(), StorageError> {
        handle
            .seek(SeekFrom::Start(pos))
            .map(|_| ())
            .map_err(|e| StorageError::from_io(StorageOp::Seek, &e))
    }

    fn write(&mut self, handle: &mut File, bytes: &[u8]) -> Result<usize, StorageError> {
        self.require_mounted(StorageOp::Write)?;
        handle
            .write_all(bytes)
            .map(|()| bytes.len())
            .map_err(|e| StorageError::from_io(StorageOp::Write, &e))
    }

    fn truncate(&mut self, handle: &mut File, len: u64) -> Result<(), StorageError> {
        handle
            .set_len(len)
            .and_then(|()| handle.seek(SeekFrom::Start(len)))
            .map(|_| ())
            .map_err(|e| StorageError::from_io(StorageOp::Truncate, &e))
    }

    fn sync(&mut self, handle: &mut File) -> Result<(), StorageError> {
        self.require_mounted(StorageOp::Sync)?;
        handle
            .sync_data()
            .map_err(|e| StorageError::from_io(StorageOp::Sync, &e))
    }

    fn close(&mut self, handle: File) -> Result<(), StorageError> {
        // closing on FAT commits the directory entry; sync_all is the host analogue
        let result = if self.mounted {
            handle
                .sync_all()
                .map_err(|e| StorageError::from_io(StorageOp::Close, &e))
        } else {
            Ok(())
        };
        drop(handle);
        result
    }
}
