//! Raw device access for logstore.
//!
//! The store keeps everything in a single byte-addressed device: a file on
//! the local file system or, for tests and benchmarks, a region of memory.
//! This crate provides the [`BlockDevice`] trait that the store consumes and
//! the two implementations.  It knows nothing about the on-disk format.

use std::sync::{Arc, Once};

use logstore_types::config::DeviceConfig;
use tracing::info;

use crate::block::BlockLocation;
use crate::error::StorageError;
use crate::memory::MemoryDevice;
use crate::posix::FileDevice;

pub mod block;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod posix;


/// A byte-addressed storage device.
///
/// Writes become durable only after a successful [`BlockDevice::sync`].
/// Implementations must be safe to use from several threads; callers are
/// responsible for not writing overlapping ranges concurrently.
pub trait BlockDevice: Send + Sync {
    /// Reads exactly `location.size` bytes starting at `location.offset`.
    ///
    /// A read that extends past the end of the device fails with
    /// [`StorageError::ShortRead`] instead of returning a partial result.
    fn read_exact_at(&self, location: BlockLocation) -> Result<Vec<u8>, StorageError>;

    /// Writes all of `data` starting at byte `offset`, extending the device
    /// if necessary.
    fn write_all_at(&self, offset: u64, data: &[u8]) -> Result<(), StorageError>;

    /// Makes all previous writes durable.
    fn sync(&self) -> Result<(), StorageError>;

    /// Returns the device's size in bytes.
    fn size(&self) -> Result<u64, StorageError>;

    /// Returns a short human-readable description, for logging.
    fn describe(&self) -> String;
}

impl<D> BlockDevice for Arc<D>
where
    D: BlockDevice + ?Sized,
{
    fn read_exact_at(&self, location: BlockLocation) -> Result<Vec<u8>, StorageError> {
        (**self).read_exact_at(location)
    }

    fn write_all_at(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        (**self).write_all_at(offset, data)
    }

    fn sync(&self) -> Result<(), StorageError> {
        (**self).sync()
    }

    fn size(&self) -> Result<u64, StorageError> {
        (**self).size()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

impl dyn BlockDevice {
    /// Opens the device described by `config`.
    ///
    /// A [`DeviceConfig::Memory`] device always starts out empty.  A file is
    /// created if it does not exist and `create` is true; otherwise a missing
    /// file is an error.
    pub fn open(config: &DeviceConfig, create: bool) -> Result<Arc<Self>, StorageError> {
        init();
        let device: Arc<dyn BlockDevice> = match config {
            DeviceConfig::Memory => Arc::new(MemoryDevice::new()),
            DeviceConfig::File { path } => Arc::new(FileDevice::open(path, create)?),
        };
        info!("opened device {}", device.describe());
        Ok(device)
    }
}

/// Performs storage module initialization.
///
/// This registers descriptions for the metrics the devices maintain.  It is
/// idempotent and opening any device calls it automatically.
pub fn init() {
    static ONCE: Once = Once::new();
    ONCE.call_once(metrics::describe_storage_metrics);
}
