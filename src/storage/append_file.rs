//! The append-positioned log file.

use super::{StorageDriver, Volume};
use crate::error::{HandleInvalidated, OpenError, StorageError, StorageErrorKind, StorageOp};

/// An open file whose write position is always end-of-file.
///
/// The offset only moves forward: it is set once by the end-of-file seek in
/// [`AppendFile::open_append`] and advanced by each successful write.
///
/// A failed [`write`](AppendFile::write) consumes the file and closes the
/// handle before returning, so an invalid handle can never be reused.
#[derive(Debug)]
pub struct AppendFile<H> {
    handle: H,
    offset: u64,
    writes: u64,
}

impl<H> AppendFile<H> {
    /// Byte offset of the next write.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Successful writes since the file was opened.
    pub fn write_count(&self) -> u64 {
        self.writes
    }

    /// Open `path`, creating it if absent, and seek to its end.
    ///
    /// Existing content is never truncated. If the size query or seek fails
    /// the handle is closed before the error is returned.
    pub fn open_append<D>(volume: &mut Volume<D>, path: &str) -> Result<Self, OpenError>
    where
        D: StorageDriver<Handle = H>,
    {
        let driver = volume.mounted_driver(StorageOp::Open)?;
        let mut handle = driver.open(path)?;

        let positioned = driver
            .file_size(&handle)
            .and_then(|size| driver.seek(&mut handle, size).map(|()| size));

        match positioned {
            Ok(offset) => {
                tracing::debug!(path, offset, "Opened log file for append");
                Ok(Self {
                    handle,
                    offset,
                    writes: 0,
                })
            }
            Err(err) => {
                if let Err(close_err) = driver.close(handle) {
                    tracing::debug!(%close_err, "Close after failed seek also failed");
                }
                Err(OpenError(err))
            }
        }
    }

    /// Append all of `bytes`.
    ///
    /// A write is all-or-nothing: on a driver error or a short write any
    /// accepted prefix is cut off again, the handle is closed, and
    /// [`HandleInvalidated`] is returned in place of the file. The next
    /// [`open_append`](AppendFile::open_append) therefore resumes at the same
    /// offset this file had.
    pub fn write<D>(mut self, volume: &mut Volume<D>, bytes: &[u8]) -> Result<Self, HandleInvalidated>
    where
        D: StorageDriver<Handle = H>,
    {
        if bytes.is_empty() {
            return Ok(self);
        }

        let outcome = volume
            .mounted_driver(StorageOp::Write)
            .and_then(|driver| driver.write(&mut self.handle, bytes));

        let cause = match outcome {
            Ok(written) if written == bytes.len() => {
                self.offset += written as u64;
                self.writes += 1;
                return Ok(self);
            }
            Ok(written) => StorageError::new(
                StorageOp::Write,
                StorageErrorKind::ShortWrite,
                format!("accepted {} of {} bytes", written, bytes.len()),
            ),
            Err(err) => err,
        };

        let rollback_error = volume
            .driver_mut()
            .truncate(&mut self.handle, self.offset)
            .err();
        if let Some(err) = &rollback_error {
            tracing::warn!(offset = self.offset, %err, "Could not roll back failed write");
        }
        let close_error = volume.driver_mut().close(self.handle).err();
        Err(HandleInvalidated {
            cause,
            rollback_error,
            close_error,
        })
    }

    /// Commit written data to the medium.
    pub fn sync<D>(&mut self, volume: &mut Volume<D>) -> Result<(), StorageError>
    where
        D: StorageDriver<Handle = H>,
    {
        volume
            .mounted_driver(StorageOp::Sync)?
            .sync(&mut self.handle)
    }

    /// Close the file. The handle is released even if the driver reports an
    /// error.
    pub fn close<D>(self, volume: &mut Volume<D>) -> Result<(), StorageError>
    where
        D: StorageDriver<Handle = H>,
    {
        volume.driver_mut().close(self.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MockCard;

    fn mounted(card: &MockCard) -> Volume<MockCard> {
        let mut volume = Volume::new(card.clone());
        volume.mount().unwrap();
        volume
    }

    #[test]
    fn open_requires_mounted_volume() {
        let mut volume = Volume::new(MockCard::new());
        let err = AppendFile::open_append(&mut volume, "data.txt").unwrap_err();
        assert_eq!(err.0.kind, StorageErrorKind::NotMounted);
    }

    #[test]
    fn open_resumes_at_end_of_existing_file() {
        let card = MockCard::new();
        card.put_file("data.txt", b"previous session\n");
        let mut volume = mounted(&card);

        let file = AppendFile::open_append(&mut volume, "data.txt").unwrap();
        assert_eq!(file.offset(), 17);

        let file = file.write(&mut volume, b"next").unwrap();
        assert_eq!(file.offset(), 21);
        assert_eq!(card.contents("data.txt").unwrap(), b"previous session\nnext");
    }

    #[test]
    fn open_creates_missing_file() {
        let card = MockCard::new();
        let mut volume = mounted(&card);
        let file = AppendFile::open_append(&mut volume, "new.txt").unwrap();
        assert_eq!(file.offset(), 0);
        assert_eq!(card.contents("new.txt").unwrap(), b"");
    }

    #[test]
    fn seek_failure_closes_handle() {
        let card = MockCard::new();
        let mut volume = mounted(&card);
        card.fail_next(StorageOp::Seek, 1, StorageErrorKind::Io);

        let err = AppendFile::open_append(&mut volume, "data.txt").unwrap_err();
        assert_eq!(err.0.op, StorageOp::Seek);
        assert_eq!(card.open_handles(), 0);
        assert_eq!(card.counters().closes, 1);
    }

    #[test]
    fn write_failure_invalidates_and_closes() {
        let card = MockCard::new();
        let mut volume = mounted(&card);
        let file = AppendFile::open_append(&mut volume, "data.txt").unwrap();
        let file = file.write(&mut volume, b"abc").unwrap();

        card.fail_next(StorageOp::Write, 1, StorageErrorKind::Io);
        let invalidated = file.write(&mut volume, b"def").unwrap_err();
        assert_eq!(invalidated.cause.op, StorageOp::Write);
        assert!(invalidated.close_error.is_none());
        assert_eq!(card.open_handles(), 0);
        assert_eq!(card.contents("data.txt").unwrap(), b"abc");
    }

    #[test]
    fn short_write_is_a_failure() {
        let card = MockCard::new();
        let mut volume = mounted(&card);
        let file = AppendFile::open_append(&mut volume, "data.txt").unwrap();

        card.fail_next(StorageOp::Write, 1, StorageErrorKind::ShortWrite);
        let invalidated = file.write(&mut volume, b"abcdef").unwrap_err();
        assert_eq!(invalidated.cause.kind, StorageErrorKind::ShortWrite);
        assert_eq!(card.open_handles(), 0);
    }

    #[test]
    fn short_write_leaves_no_partial_bytes() {
        let card = MockCard::new();
        let mut volume = mounted(&card);
        let file = AppendFile::open_append(&mut volume, "data.txt").unwrap();
        let file = file.write(&mut volume, b"0123").unwrap();

        card.fail_next(StorageOp::Write, 1, StorageErrorKind::ShortWrite);
        let invalidated = file.write(&mut volume, b"abcdef").unwrap_err();
        assert!(invalidated.rollback_error.is_none());
        assert_eq!(card.contents("data.txt").unwrap(), b"0123");
        assert_eq!(card.synced_len("data.txt"), Some(4));

        let file = AppendFile::open_append(&mut volume, "data.txt").unwrap();
        assert_eq!(file.offset(), 4);
    }

    #[test]
    fn rollback_failure_is_reported() {
        let card = MockCard::new();
        let mut volume = mounted(&card);
        let file = AppendFile::open_append(&mut volume, "data.txt").unwrap();

        card.fail_next(StorageOp::Write, 1, StorageErrorKind::ShortWrite);
        card.fail_next(StorageOp::Truncate, 1, StorageErrorKind::Io);
        let invalidated = file.write(&mut volume, b"abcdef").unwrap_err();
        assert_eq!(
            invalidated.rollback_error.map(|e| e.op),
            Some(StorageOp::Truncate)
        );
        assert_eq!(card.open_handles(), 0);
        assert_eq!(card.contents("data.txt").unwrap(), b"abc");
    }

    #[test]
    fn empty_write_is_a_no_op() {
        let card = MockCard::new();
        let mut volume = mounted(&card);
        let file = AppendFile::open_append(&mut volume, "data.txt").unwrap();
        let file = file.write(&mut volume, b"").unwrap();
        assert_eq!(file.write_count(), 0);
        assert_eq!(card.counters().writes, 0);
    }
}
