use serde::Serialize;
use std::fmt::{Display, Formatter, Result as FmtResult};

/// A range of bytes on a device.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct BlockLocation {
    /// Byte offset of the first byte.
    pub offset: u64,

    /// Number of bytes.
    pub size: usize,
}

impl BlockLocation {
    pub const fn new(offset: u64, size: usize) -> Self {
        Self { offset, size }
    }

    /// Returns the offset just past the last byte, or `None` if that is
    /// not representable.
    pub const fn after(&self) -> Option<u64> {
        self.offset.checked_add(self.size as u64)
    }
}

impl Display for BlockLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{} bytes at offset {}", self.size, self.offset)
    }
}
