//! [BlockDevice] implementation in memory.
//!
//! Besides serving as a fast device for tests, this device models the
//! difference between written and durable data: writes land in a volatile
//! image and only [`BlockDevice::sync`] copies them into the durable image.
//! [`MemoryDevice::crash`] throws away everything that was not synced, which
//! is what a power failure does to a real disk.

use metrics::counter;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::block::BlockLocation;
use crate::error::StorageError;
use crate::metrics::{
    READS_FAILED, READS_SUCCESS, SYNCS, TOTAL_BYTES_READ, TOTAL_BYTES_WRITTEN, WRITES_FAILED,
    WRITES_SUCCESS,
};
use crate::BlockDevice;

#[derive(Default)]
struct Images {
    /// What a reader sees.
    volatile: Vec<u8>,

    /// What survives a crash.
    durable: Vec<u8>,

    /// Number of writes still accepted before the device refuses further
    /// writes, or `None` for no limit.
    writes_before_crash: Option<usize>,

    /// Number of writes still accepted before exactly one write fails, or
    /// `None`.
    writes_before_failure: Option<usize>,
}

/// An in-memory device.
///
/// Cloning a `MemoryDevice` yields another handle to the same storage, so a
/// test can keep a handle, drop the store, [crash](Self::crash) the device
/// and open a new store on it.
#[derive(Clone, Default)]
pub struct MemoryDevice {
    images: Arc<Mutex<Images>>,
}

impl MemoryDevice {
    /// Creates a new, empty device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a device whose durable and volatile contents are `image`.
    pub fn from_image(image: Vec<u8>) -> Self {
        Self {
            images: Arc::new(Mutex::new(Images {
                volatile: image.clone(),
                durable: image,
                writes_before_crash: None,
                writes_before_failure: None,
            })),
        }
    }

    fn images(&self) -> MutexGuard<'_, Images> {
        self.images.lock().unwrap()
    }

    /// Simulates a power failure: all writes since the last sync are lost
    /// and the device accepts writes again.
    pub fn crash(&self) {
        let mut images = self.images();
        images.volatile = images.durable.clone();
        images.writes_before_crash = None;
    }

    /// Lets the next `n` writes succeed and fails every write after that
    /// with [`StorageError::Crashed`] until [`crash`](Self::crash) is called.
    pub fn crash_after_writes(&self, n: usize) {
        self.images().writes_before_crash = Some(n);
    }

    /// Lets the next `n` writes succeed, fails the one after that with an
    /// I/O error, and then accepts writes again.
    pub fn fail_write_after(&self, n: usize) {
        self.images().writes_before_failure = Some(n);
    }

    /// Returns a copy of the durable contents.
    pub fn durable_image(&self) -> Vec<u8> {
        self.images().durable.clone()
    }
}

impl BlockDevice for MemoryDevice {
    fn read_exact_at(&self, location: BlockLocation) -> Result<Vec<u8>, StorageError> {
        let images = self.images();
        let size = images.volatile.len() as u64;
        if location.after().is_none_or(|after| after > size) {
            counter!(READS_FAILED).increment(1);
            return Err(StorageError::ShortRead { location, size });
        }
        let start = location.offset as usize;
        let block = images.volatile[start..start + location.size].to_vec();
        counter!(TOTAL_BYTES_READ).increment(block.len() as u64);
        counter!(READS_SUCCESS).increment(1);
        Ok(block)
    }

    fn write_all_at(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let mut images = self.images();
        if let Some(remaining) = images.writes_before_crash.as_mut() {
            if *remaining == 0 {
                counter!(WRITES_FAILED).increment(1);
                return Err(StorageError::Crashed(BlockLocation::new(offset, data.len())));
            }
            *remaining -= 1;
        }
        match images.writes_before_failure {
            Some(0) => {
                images.writes_before_failure = None;
                counter!(WRITES_FAILED).increment(1);
                return Err(StorageError::StdIo(ErrorKind::Other));
            }
            Some(n) => images.writes_before_failure = Some(n - 1),
            None => (),
        }

        let start = offset as usize;
        let end = start + data.len();
        if images.volatile.len() < end {
            images.volatile.resize(end, 0);
        }
        images.volatile[start..end].copy_from_slice(data);

        counter!(TOTAL_BYTES_WRITTEN).increment(data.len() as u64);
        counter!(WRITES_SUCCESS).increment(1);
        Ok(())
    }

    fn sync(&self) -> Result<(), StorageError> {
        let mut images = self.images();
        if images.writes_before_crash == Some(0) {
            return Err(StorageError::Crashed(BlockLocation::new(0, 0)));
        }
        images.durable = images.volatile.clone();
        counter!(SYNCS).increment(1);
        Ok(())
    }

    fn size(&self) -> Result<u64, StorageError> {
        Ok(self.images().volatile.len() as u64)
    }

    fn describe(&self) -> String {
        String::from("memory")
    }
}
