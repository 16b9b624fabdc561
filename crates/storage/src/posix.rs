//! [BlockDevice] implementation using POSIX I/O on a single file.

use metrics::{counter, histogram};
use std::{
    fs::{File, OpenOptions},
    io::{self, Error as IoError, ErrorKind},
    os::{fd::AsRawFd, unix::fs::FileExt},
    path::{Path, PathBuf},
    time::Instant,
};
use tracing::debug;

use crate::block::BlockLocation;
use crate::error::StorageError;
use crate::metrics::{
    READS_FAILED, READS_SUCCESS, SYNCS, SYNC_LATENCY, TOTAL_BYTES_READ, TOTAL_BYTES_WRITTEN,
    WRITES_FAILED, WRITES_SUCCESS,
};
use crate::BlockDevice;

/// A file that holds an exclusive advisory lock.
///
/// The lock is dropped once the guard is dropped.  This keeps two processes
/// from opening the same store file for writing.
struct FlockGuard(File);

impl FlockGuard {
    fn new(file: File) -> Result<FlockGuard, IoError> {
        let r = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if r != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(FlockGuard(file))
    }
}

impl Drop for FlockGuard {
    fn drop(&mut self) {
        let r = unsafe { libc::flock(self.0.as_raw_fd(), libc::LOCK_UN) };
        if r != 0 {
            debug!("Failed to unlock store file: {}", io::Error::last_os_error());
        }
    }
}

/// A store file on the local file system.
pub struct FileDevice {
    file: FlockGuard,
    path: PathBuf,
}

impl FileDevice {
    /// Opens the file at `path` for reading and writing, creating it if it
    /// does not exist and `create` is true.
    ///
    /// Fails with [`StorageError::StorageLocked`] if another open
    /// `FileDevice` holds the file.
    pub fn open<P: AsRef<Path>>(path: P, create: bool) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(&path)
            .map_err(|error| match error.kind() {
                ErrorKind::NotFound => StorageError::NotFound(path.clone()),
                _ => error.into(),
            })?;
        let file = FlockGuard::new(file).map_err(|error| {
            if error.kind() == ErrorKind::WouldBlock {
                StorageError::StorageLocked(path.clone())
            } else {
                error.into()
            }
        })?;
        Ok(Self { file, path })
    }

    /// Returns the file's path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileDevice {
    fn read_exact_at(&self, location: BlockLocation) -> Result<Vec<u8>, StorageError> {
        let mut buffer = vec![0; location.size];
        match self.file.0.read_exact_at(&mut buffer, location.offset) {
            Ok(()) => {
                counter!(TOTAL_BYTES_READ).increment(buffer.len() as u64);
                counter!(READS_SUCCESS).increment(1);
                Ok(buffer)
            }
            Err(error) => {
                counter!(READS_FAILED).increment(1);
                if error.kind() == ErrorKind::UnexpectedEof {
                    Err(StorageError::ShortRead {
                        location,
                        size: self.size()?,
                    })
                } else {
                    Err(error.into())
                }
            }
        }
    }

    fn write_all_at(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        match self.file.0.write_all_at(data, offset) {
            Ok(()) => {
                counter!(TOTAL_BYTES_WRITTEN).increment(data.len() as u64);
                counter!(WRITES_SUCCESS).increment(1);
                Ok(())
            }
            Err(error) => {
                counter!(WRITES_FAILED).increment(1);
                Err(error.into())
            }
        }
    }

    fn sync(&self) -> Result<(), StorageError> {
        let start = Instant::now();
        self.file.0.sync_data()?;
        counter!(SYNCS).increment(1);
        histogram!(SYNC_LATENCY).record(start.elapsed().as_secs_f64());
        Ok(())
    }

    fn size(&self) -> Result<u64, StorageError> {
        Ok(self.file.0.metadata()?.len())
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}
