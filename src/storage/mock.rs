//! Simulated SD card with fault injection.
//!
//! `MockCard` is a cheap-to-clone handle onto shared card state, so a test can
//! hand one clone to the logger and keep another to inject faults and inspect
//! file contents.
//!
//! # Behavior
//!
//! - Data written to a file is visible immediately through
//!   [`MockCard::contents`], but only counts as durable once the file is
//!   synced or closed ([`MockCard::synced_len`]).
//! - Unmounting invalidates every open handle, as a FAT driver does. Any later
//!   operation through such a handle fails with `InvalidHandle` and is counted
//!   in [`CardCounters::invalid_handle_ops`].
//! - Injected faults fail the next N calls of an operation. A `ShortWrite`
//!   fault on `Write` accepts half the bytes instead of failing outright.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use super::StorageDriver;
use crate::error::{StorageError, StorageErrorKind, StorageOp};

/// Call counters for assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CardCounters {
    /// Mount calls.
    pub mounts: u64,
    /// Unmount calls.
    pub unmounts: u64,
    /// Open calls.
    pub opens: u64,
    /// Seek calls.
    pub seeks: u64,
    /// Write calls, including short ones.
    pub writes: u64,
    /// Truncate calls.
    pub truncates: u64,
    /// Sync calls.
    pub syncs: u64,
    /// Close calls.
    pub closes: u64,
    /// Calls that failed, injected or not.
    pub failures: u64,
    /// Operations attempted through a handle that was no longer open.
    pub invalid_handle_ops: u64,
}

#[derive(Debug, Default)]
struct MockFile {
    data: Vec<u8>,
    synced_len: usize,
}

#[derive(Debug, Clone, Copy)]
struct Fault {
    remaining: u32,
    kind: StorageErrorKind,
}

#[derive(Debug)]
struct CardState {
    present: bool,
    formatted: bool,
    mounted: bool,
    files: HashMap<String, MockFile>,
    open: HashSet<u64>,
    next_handle: u64,
    faults: HashMap<StorageOp, Fault>,
    counters: CardCounters,
}

impl CardState {
    /// Consume one injected fault for `op`, if any.
    fn take_fault(&mut self, op: StorageOp) -> Option<StorageErrorKind> {
        let fault = self.faults.get_mut(&op)?;
        let kind = fault.kind;
        fault.remaining -= 1;
        if fault.remaining == 0 {
            self.faults.remove(&op);
        }
        Some(kind)
    }

    fn fail(&mut self, op: StorageOp, kind: StorageErrorKind, message: &str) -> StorageError {
        self.counters.failures += 1;
        if kind == StorageErrorKind::InvalidHandle {
            self.counters.invalid_handle_ops += 1;
        }
        StorageError::new(op, kind, message)
    }

    /// Handle validity and mount state, then any injected fault for `op`.
    fn check_handle(&mut self, op: StorageOp, handle: &MockHandle) -> Result<(), StorageError> {
        if !self.open.contains(&handle.id) {
            return Err(self.fail(op, StorageErrorKind::InvalidHandle, "handle is not open"));
        }
        if !self.mounted {
            return Err(self.fail(op, StorageErrorKind::NotMounted, "card is not mounted"));
        }
        match self.take_fault(op) {
            Some(kind) => Err(self.fail(op, kind, "injected fault")),
            None => Ok(()),
        }
    }

    fn commit(&mut self, path: &str) {
        if let Some(file) = self.files.get_mut(path) {
            file.synced_len = file.data.len();
        }
    }
}

/// Open-file token issued by [`MockCard`].
#[derive(Debug)]
pub struct MockHandle {
    id: u64,
    path: String,
    pos: usize,
}

/// In-memory SD card.
#[derive(Debug, Clone)]
pub struct MockCard {
    state: Arc<Mutex<CardState>>,
}

impl Default for MockCard {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCard {
    /// A present, formatted, empty card.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(CardState {
                present: true,
                formatted: true,
                mounted: false,
                files: HashMap::new(),
                open: HashSet::new(),
                next_handle: 1,
                faults: HashMap::new(),
                counters: CardCounters::default(),
            })),
        }
    }

    /// Pull the card out. Operations on open handles fail with `NotMounted`
    /// until the card is remounted.
    pub fn remove(&self) {
        let mut state = self.state.lock();
        state.present = false;
        state.mounted = false;
    }

    /// Put the card back. It still needs a mount.
    pub fn insert(&self) {
        self.state.lock().present = true;
    }

    /// An unformatted card mounts as `FilesystemUnrecognized`.
    pub fn set_formatted(&self, formatted: bool) {
        self.state.lock().formatted = formatted;
    }

    /// Fail the next `times` calls of `op` with `kind`.
    pub fn fail_next(&self, op: StorageOp, times: u32, kind: StorageErrorKind) {
        let mut state = self.state.lock();
        if times == 0 {
            state.faults.remove(&op);
        } else {
            state.faults.insert(
                op,
                Fault {
                    remaining: times,
                    kind,
                },
            );
        }
    }

    /// Fail every call of `op` until [`MockCard::clear_faults`].
    pub fn fail_always(&self, op: StorageOp, kind: StorageErrorKind) {
        self.fail_next(op, u32::MAX, kind);
    }

    /// Drop every pending injected fault.
    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Seed a file with durable content.
    pub fn put_file(&self, path: &str, data: &[u8]) {
        self.state.lock().files.insert(
            path.to_string(),
            MockFile {
                data: data.to_vec(),
                synced_len: data.len(),
            },
        );
    }

    /// Everything written to `path`, synced or not.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().files.get(path).map(|f| f.data.clone())
    }

    /// Bytes of `path` that have been committed by sync or close.
    pub fn synced_len(&self, path: &str) -> Option<usize> {
        self.state.lock().files.get(path).map(|f| f.synced_len)
    }

    /// Drop unsynced data from every file, as a power cut would.
    pub fn lose_unsynced(&self) {
        let mut state = self.state.lock();
        for file in state.files.values_mut() {
            let synced = file.synced_len;
            file.data.truncate(synced);
        }
    }

    /// Whether the card is mounted.
    pub fn is_mounted(&self) -> bool {
        self.state.lock().mounted
    }

    /// Handles opened and not yet closed or invalidated.
    pub fn open_handles(&self) -> usize {
        self.state.lock().open.len()
    }

    /// Snapshot of the call counters.
    pub fn counters(&self) -> CardCounters {
        self.state.lock().counters
    }
}

impl StorageDriver for MockCard {
    type Handle = MockHandle;

    fn mount(&mut self) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.counters.mounts += 1;
        if !state.present {
            return Err(state.fail(StorageOp::Mount, StorageErrorKind::DeviceAbsent, "no card"));
        }
        if let Some(kind) = state.take_fault(StorageOp::Mount) {
            return Err(state.fail(StorageOp::Mount, kind, "injected fault"));
        }
        if !state.formatted {
            return Err(state.fail(
                StorageOp::Mount,
                StorageErrorKind::FilesystemUnrecognized,
                "no FAT volume found",
            ));
        }
        state.mounted = true;
        Ok(())
    }

    fn unmount(&mut self) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.counters.unmounts += 1;
        state.mounted = false;
        state.open.clear();
        if let Some(kind) = state.take_fault(StorageOp::Unmount) {
            return Err(state.fail(StorageOp::Unmount, kind, "injected fault"));
        }
        Ok(())
    }

    fn open(&mut self, path: &str) -> Result<MockHandle, StorageError> {
        let mut state = self.state.lock();
        state.counters.opens += 1;
        if !state.mounted {
            return Err(state.fail(StorageOp::Open, StorageErrorKind::NotMounted, "card is not mounted"));
        }
        if let Some(kind) = state.take_fault(StorageOp::Open) {
            return Err(state.fail(StorageOp::Open, kind, "injected fault"));
        }
        state.files.entry(path.to_string()).or_default();
        let id = state.next_handle;
        state.next_handle += 1;
        state.open.insert(id);
        Ok(MockHandle {
            id,
            path: path.to_string(),
            pos: 0,
        })
    }

    fn file_size(&mut self, handle: &MockHandle) -> Result<u64, StorageError> {
        let state = self.state.lock();
        Ok(state
            .files
            .get(&handle.path)
            .map_or(0, |f| f.data.len() as u64))
    }

    fn seek(&mut self, handle: &mut MockHandle, pos: u64) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.counters.seeks += 1;
        state.check_handle(StorageOp::Seek, handle)?;
        handle.pos = pos as usize;
        Ok(())
    }

    fn write(&mut self, handle: &mut MockHandle, bytes: &[u8]) -> Result<usize, StorageError> {
        let mut state = self.state.lock();
        state.counters.writes += 1;

        let short = matches!(
            state.faults.get(&StorageOp::Write),
            Some(Fault {
                kind: StorageErrorKind::ShortWrite,
                ..
            })
        );
        let accepted = if short && state.open.contains(&handle.id) && state.mounted {
            state.take_fault(StorageOp::Write);
            bytes.len() / 2
        } else {
            state.check_handle(StorageOp::Write, handle)?;
            bytes.len()
        };

        let file = state.files.entry(handle.path.clone()).or_default();
        let end = handle.pos + accepted;
        if file.data.len() < end {
            file.data.resize(end, 0);
        }
        file.data[handle.pos..end].copy_from_slice(&bytes[..accepted]);
        handle.pos = end;
        Ok(accepted)
    }

    fn truncate(&mut self, handle: &mut MockHandle, len: u64) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.counters.truncates += 1;
        state.check_handle(StorageOp::Truncate, handle)?;
        let len = len as usize;
        if let Some(file) = state.files.get_mut(&handle.path) {
            file.data.truncate(len);
            file.synced_len = file.synced_len.min(len);
        }
        handle.pos = len;
        Ok(())
    }

    fn sync(&mut self, handle: &mut MockHandle) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.counters.syncs += 1;
        state.check_handle(StorageOp::Sync, handle)?;
        state.commit(&handle.path);
        Ok(())
    }

    fn close(&mut self, handle: MockHandle) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.counters.closes += 1;
        state.check_handle(StorageOp::Close, &handle)?;
        state.commit(&handle.path);
        state.open.remove(&handle.id);
        Ok(())
    }
}
