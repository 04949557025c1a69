//! FAT volume driver on a raw block device.
//!
//! [`FatDriver`] runs the FAT filesystem itself through `embedded-sdmmc`, as
//! the flight computer does over SPI. Mount reads the MBR and the boot sector
//! of the first partition, and the log file lives in the root directory under
//! an 8.3 name. Any [`BlockDevice`] works; [`ImageDevice`] exposes a disk
//! image, or a raw card node such as `/dev/mmcblk0`, as one.
//!
//! Every mount builds a fresh `VolumeManager` over a freshly acquired device,
//! so nothing cached from a pulled card survives. Handles carry the mount
//! generation they were opened under; a handle from an earlier mount is
//! rejected with `InvalidHandle` instead of aliasing a new file.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use embedded_sdmmc::{
    Block, BlockCount, BlockDevice, BlockIdx, Mode, RawDirectory, RawFile, RawVolume, TimeSource,
    Timestamp, VolumeIdx, VolumeManager,
};

use super::StorageDriver;
use crate::error::{StorageError, StorageErrorKind, StorageOp};

/// Timestamps for directory entries.
///
/// The flight computer has no battery-backed clock, so every entry gets the
/// same fixed date.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedClock;

impl TimeSource for FixedClock {
    fn get_timestamp(&self) -> Timestamp {
        Timestamp {
            year_since_1970: 54,
            zero_indexed_month: 0,
            zero_indexed_day: 0,
            hours: 0,
            minutes: 0,
            seconds: 0,
        }
    }
}

/// A file or device node addressed in 512-byte blocks.
#[derive(Debug, Clone)]
pub struct ImageDevice {
    file: Arc<File>,
}

impl ImageDevice {
    /// Open an existing image or device node for reading and writing.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            file: Arc::new(file),
        })
    }
}

impl BlockDevice for ImageDevice {
    type Error = io::Error;

    fn read(&self, blocks: &mut [Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        let mut file = &*self.file;
        file.seek(SeekFrom::Start(u64::from(start_block_idx.0) * Block::LEN as u64))?;
        for block in blocks.iter_mut() {
            file.read_exact(&mut block.contents)?;
        }
        Ok(())
    }

    fn write(&self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        let mut file = &*self.file;
        file.seek(SeekFrom::Start(u64::from(start_block_idx.0) * Block::LEN as u64))?;
        for block in blocks {
            file.write_all(&block.contents)?;
        }
        Ok(())
    }

    fn num_blocks(&self) -> Result<BlockCount, Self::Error> {
        // metadata().len() is zero for device nodes; seeking to the end is not
        let len = (&*self.file).seek(SeekFrom::End(0))?;
        let blocks = u32::try_from(len / Block::LEN as u64)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "device too large"))?;
        Ok(BlockCount(blocks))
    }
}

/// Open-file token issued by [`FatDriver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatHandle {
    file: RawFile,
    generation: u64,
}

struct Mounted<B: BlockDevice> {
    manager: VolumeManager<B, FixedClock>,
    volume: RawVolume,
    root: RawDirectory,
}

type Connect<B> = Box<dyn FnMut() -> Result<B, StorageError> + Send>;

/// FAT16/FAT32 filesystem on the first MBR partition of a block device.
pub struct FatDriver<B: BlockDevice> {
    connect: Connect<B>,
    mounted: Option<Mounted<B>>,
    generation: u64,
}

impl<B: BlockDevice> FatDriver<B> {
    /// Driver that calls `connect` to acquire the device on every mount.
    ///
    /// `connect` reports a missing card as `DeviceAbsent`.
    pub fn new<F>(connect: F) -> Self
    where
        F: FnMut() -> Result<B, StorageError> + Send + 'static,
    {
        Self {
            connect: Box::new(connect),
            mounted: None,
            generation: 0,
        }
    }

    /// Whether a volume is currently open.
    pub fn is_mounted(&self) -> bool {
        self.mounted.is_some()
    }

    fn require_mounted(&self, op: StorageOp) -> Result<&Mounted<B>, StorageError> {
        self.mounted
            .as_ref()
            .ok_or_else(|| StorageError::new(op, StorageErrorKind::NotMounted, "no FAT volume open"))
    }

    /// The mounted volume, if `handle` was opened under the current mount.
    fn for_handle(&self, op: StorageOp, handle: &FatHandle) -> Result<&Mounted<B>, StorageError> {
        let mounted = self.require_mounted(op)?;
        if handle.generation != self.generation {
            return Err(StorageError::new(
                op,
                StorageErrorKind::InvalidHandle,
                "handle belongs to an earlier mount",
            ));
        }
        Ok(mounted)
    }
}

impl FatDriver<ImageDevice> {
    /// Driver over the image or device node at `path`. A missing path mounts
    /// as `DeviceAbsent`.
    pub fn image(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self::new(move || {
            ImageDevice::open(&path).map_err(|e| StorageError::from_io(StorageOp::Mount, &e))
        })
    }
}

fn fat_error<E: std::fmt::Debug>(op: StorageOp, err: embedded_sdmmc::Error<E>) -> StorageError {
    use embedded_sdmmc::Error;

    let kind = match &err {
        Error::DeviceError(_) if op == StorageOp::Mount => StorageErrorKind::DeviceAbsent,
        Error::FormatError(_) | Error::NoSuchVolume => StorageErrorKind::FilesystemUnrecognized,
        Error::BadHandle => StorageErrorKind::InvalidHandle,
        _ => StorageErrorKind::Io,
    };
    StorageError::new(op, kind, format!("{err:?}"))
}

fn position(op: StorageOp, pos: u64) -> Result<u32, StorageError> {
    u32::try_from(pos).map_err(|_| {
        StorageError::new(op, StorageErrorKind::Io, format!("offset {pos} exceeds FAT file limit"))
    })
}

impl<B: BlockDevice> StorageDriver for FatDriver<B> {
    type Handle = FatHandle;

    fn mount(&mut self) -> Result<(), StorageError> {
        self.unmount()?;

        let device = (self.connect)()?;
        let manager = VolumeManager::new(device, FixedClock);
        let volume = manager
            .open_raw_volume(VolumeIdx(0))
            .map_err(|e| fat_error(StorageOp::Mount, e))?;
        let root = manager
            .open_root_dir(volume)
            .map_err(|e| fat_error(StorageOp::Mount, e))?;

        self.generation += 1;
        self.mounted = Some(Mounted {
            manager,
            volume,
            root,
        });
        tracing::debug!(generation = self.generation, "FAT volume opened");
        Ok(())
    }

    fn unmount(&mut self) -> Result<(), StorageError> {
        let Some(mounted) = self.mounted.take() else {
            return Ok(());
        };
        // the manager is dropped either way; close errors only mean files were
        // still open or the card is gone
        if let Err(err) = mounted.manager.close_dir(mounted.root) {
            tracing::debug!(?err, "Closing FAT root directory failed");
        }
        if let Err(err) = mounted.manager.close_volume(mounted.volume) {
            tracing::debug!(?err, "Closing FAT volume failed");
        }
        Ok(())
    }

    fn open(&mut self, path: &str) -> Result<FatHandle, StorageError> {
        let generation = self.generation;
        let mounted = self.require_mounted(StorageOp::Open)?;
        let name = path.to_ascii_uppercase();
        let file = mounted
            .manager
            .open_file_in_dir(mounted.root, name.as_str(), Mode::ReadWriteCreateOrAppend)
            .map_err(|e| fat_error(StorageOp::Open, e))?;
        Ok(FatHandle { file, generation })
    }

    fn file_size(&mut self, handle: &FatHandle) -> Result<u64, StorageError> {
        let mounted = self.for_handle(StorageOp::Seek, handle)?;
        mounted
            .manager
            .file_length(handle.file)
            .map(u64::from)
            .map_err(|e| fat_error(StorageOp::Seek, e))
    }

    fn seek(&mut self, handle: &mut FatHandle, pos: u64) -> Result<(), StorageError> {
        let mounted = self.for_handle(StorageOp::Seek, handle)?;
        let pos = position(StorageOp::Seek, pos)?;
        mounted
            .manager
            .file_seek_from_start(handle.file, pos)
            .map_err(|e| fat_error(StorageOp::Seek, e))
    }

    fn write(&mut self, handle: &mut FatHandle, bytes: &[u8]) -> Result<usize, StorageError> {
        let mounted = self.for_handle(StorageOp::Write, handle)?;
        mounted
            .manager
            .write(handle.file, bytes)
            .map(|()| bytes.len())
            .map_err(|e| fat_error(StorageOp::Write, e))
    }

    /// FAT has no in-place shrink here, so only a no-op cut succeeds. The
    /// cluster chain would have to be rewritten to drop a tail.
    fn truncate(&mut self, handle: &mut FatHandle, len: u64) -> Result<(), StorageError> {
        let mounted = self.for_handle(StorageOp::Truncate, handle)?;
        let current = mounted
            .manager
            .file_length(handle.file)
            .map_err(|e| fat_error(StorageOp::Truncate, e))?;
        if u64::from(current) != len {
            return Err(StorageError::new(
                StorageOp::Truncate,
                StorageErrorKind::Io,
                format!("cannot cut FAT file from {current} to {len} bytes"),
            ));
        }
        let pos = position(StorageOp::Truncate, len)?;
        mounted
            .manager
            .file_seek_from_start(handle.file, pos)
            .map_err(|e| fat_error(StorageOp::Truncate, e))
    }

    fn sync(&mut self, handle: &mut FatHandle) -> Result<(), StorageError> {
        let mounted = self.for_handle(StorageOp::Sync, handle)?;
        mounted
            .manager
            .flush_file(handle.file)
            .map_err(|e| fat_error(StorageOp::Sync, e))
    }

    fn close(&mut self, handle: FatHandle) -> Result<(), StorageError> {
        let mounted = self.for_handle(StorageOp::Close, &handle)?;
        mounted
            .manager
            .close_file(handle.file)
            .map_err(|e| fat_error(StorageOp::Close, e))
    }
}

impl<B: BlockDevice> std::fmt::Debug for FatDriver<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FatDriver")
            .field("mounted", &self.is_mounted())
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Blocks in an image written by [`create_fat16_image`] (4 MiB).
pub const IMAGE_BLOCKS: u32 = 8192;

const PARTITION_START: u32 = 1;
const RESERVED_BLOCKS: u16 = 1;
const FAT_COUNT: u8 = 2;
const FAT_BLOCKS: u16 = 32;
const ROOT_ENTRIES: u16 = 512;

/// Write a blank, MBR-partitioned FAT16 card image to `path`.
///
/// One partition spans the image after the MBR, with one block per cluster.
/// Used to prepare host runs and tests; the flight card is formatted on the
/// ground.
pub fn create_fat16_image(path: impl AsRef<Path>) -> io::Result<()> {
    let partition_blocks = IMAGE_BLOCKS - PARTITION_START;
    let mut image = vec![0u8; IMAGE_BLOCKS as usize * Block::LEN];

    // MBR with a single FAT16 partition entry
    let entry = &mut image[446..462];
    entry[4] = 0x06;
    entry[8..12].copy_from_slice(&PARTITION_START.to_le_bytes());
    entry[12..16].copy_from_slice(&partition_blocks.to_le_bytes());
    image[510] = 0x55;
    image[511] = 0xAA;

    let boot_start = PARTITION_START as usize * Block::LEN;
    let boot = &mut image[boot_start..boot_start + Block::LEN];
    boot[0..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
    boot[3..11].copy_from_slice(b"FLTLOG  ");
    boot[11..13].copy_from_slice(&(Block::LEN as u16).to_le_bytes());
    boot[13] = 1;
    boot[14..16].copy_from_slice(&RESERVED_BLOCKS.to_le_bytes());
    boot[16] = FAT_COUNT;
    boot[17..19].copy_from_slice(&ROOT_ENTRIES.to_le_bytes());
    let total16 = u16::try_from(partition_blocks)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "image too large for FAT16"))?;
    boot[19..21].copy_from_slice(&total16.to_le_bytes());
    boot[21] = 0xF8;
    boot[22..24].copy_from_slice(&FAT_BLOCKS.to_le_bytes());
    boot[24..26].copy_from_slice(&32u16.to_le_bytes());
    boot[26..28].copy_from_slice(&64u16.to_le_bytes());
    boot[28..32].copy_from_slice(&PARTITION_START.to_le_bytes());
    boot[36] = 0x80;
    boot[38] = 0x29;
    boot[39..43].copy_from_slice(&0x464C_4F47u32.to_le_bytes());
    boot[43..54].copy_from_slice(b"FLIGHTLOG  ");
    boot[54..62].copy_from_slice(b"FAT16   ");
    boot[510] = 0x55;
    boot[511] = 0xAA;

    // media descriptor and end-of-chain markers for clusters 0 and 1
    for fat in 0..usize::from(FAT_COUNT) {
        let start = boot_start
            + (usize::from(RESERVED_BLOCKS) + fat * usize::from(FAT_BLOCKS)) * Block::LEN;
        image[start..start + 4].copy_from_slice(&[0xF8, 0xFF, 0xFF, 0xFF]);
    }

    std::fs::write(path, image)
}
