use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::io::ErrorKind;
use std::path::PathBuf;
use thiserror::Error;

use crate::block::BlockLocation;

/// An error that can occur when using a block device.
#[derive(Clone, Error, Debug, Serialize, PartialEq, Eq)]
pub enum StorageError {
    /// I/O error.
    #[error("{0}")]
    #[serde(serialize_with = "serialize_io_error")]
    StdIo(ErrorKind),

    /// A read extended past the end of the device.
    ///
    /// This API treats a read past the end as an error rather than returning
    /// a partial result.
    #[error("Read of {location} extends past the end of the device ({size} bytes).")]
    ShortRead {
        /// The requested range.
        location: BlockLocation,
        /// Device size at the time of the read.
        size: u64,
    },

    /// Another process holds the lock on the store file.
    ///
    /// If this is not expected, verify that no other process has the file
    /// open before retrying.
    #[error("Another process is already using the store file {0:?}.")]
    StorageLocked(PathBuf),

    /// The store file does not exist and creating it was not requested.
    #[error("Store file {0:?} does not exist.")]
    NotFound(PathBuf),

    /// The device stopped accepting writes because a simulated crash point
    /// was reached.
    #[error("Device crashed; write of {0} was not persisted.")]
    Crashed(BlockLocation),
}

impl From<std::io::Error> for StorageError {
    fn from(value: std::io::Error) -> Self {
        Self::StdIo(value.kind())
    }
}

fn serialize_io_error<S>(kind: &ErrorKind, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut ser = serializer.serialize_struct("IOError", 1)?;
    ser.serialize_field("kind", &kind.to_string())?;
    ser.end()
}
