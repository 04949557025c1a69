//! Mount manager for the logging volume.

use super::StorageDriver;
use crate::error::{MountError, StorageError, StorageErrorKind, StorageOp};

/// Whether the filesystem is currently usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    /// No filesystem state; file operations are refused.
    Unmounted,
    /// The driver recognized the filesystem.
    Mounted,
}

/// Owns a storage driver and its mount state.
///
/// A volume starts unmounted. File operations go through
/// [`Volume::mounted_driver`], which refuses access while unmounted.
pub struct Volume<D: StorageDriver> {
    driver: D,
    state: MountState,
    mounts: u64,
}

impl<D: StorageDriver> Volume<D> {
    /// An unmounted volume over `driver`.
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            state: MountState::Unmounted,
            mounts: 0,
        }
    }

    /// Current mount state.
    pub fn state(&self) -> MountState {
        self.state
    }

    /// Shorthand for `state() == MountState::Mounted`.
    pub fn is_mounted(&self) -> bool {
        self.state == MountState::Mounted
    }

    /// Number of successful mounts over the volume's lifetime.
    pub fn mount_count(&self) -> u64 {
        self.mounts
    }

    /// Mount the filesystem.
    ///
    /// Mounting an already-mounted volume releases the existing state first,
    /// so this always reinitializes the device. On failure the volume is left
    /// unmounted.
    pub fn mount(&mut self) -> Result<(), MountError> {
        if self.is_mounted() {
            tracing::debug!("Volume already mounted, reinitializing");
            self.unmount();
        }

        match self.driver.mount() {
            Ok(()) => {
                self.state = MountState::Mounted;
                self.mounts += 1;
                tracing::debug!(mounts = self.mounts, "Volume mounted");
                Ok(())
            }
            Err(err) => {
                self.state = MountState::Unmounted;
                Err(MountError(err))
            }
        }
    }

    /// Release filesystem state unconditionally.
    ///
    /// Driver errors are logged and otherwise ignored; the volume is always
    /// unmounted afterwards and can be mounted again.
    pub fn unmount(&mut self) {
        if let Err(err) = self.driver.unmount() {
            tracing::warn!(%err, "Unmount reported an error, continuing");
        }
        self.state = MountState::Unmounted;
    }

    /// Driver access for file operations, or `NotMounted` for `op`.
    pub fn mounted_driver(&mut self, op: StorageOp) -> Result<&mut D, StorageError> {
        if self.is_mounted() {
            Ok(&mut self.driver)
        } else {
            Err(StorageError::new(
                op,
                StorageErrorKind::NotMounted,
                "volume is not mounted",
            ))
        }
    }

    /// Driver access regardless of mount state.
    ///
    /// Used to release handles, which must happen even after the filesystem
    /// went away.
    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }
}

impl<D: StorageDriver> std::fmt::Debug for Volume<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("state", &self.state)
            .field("mounts", &self.mounts)
            .finish_non_exhaustive()
    }
}
