//! LBA extents: append-only logs of [`LbaEntry`] records.
//!
//! | Offset | Size         | Contents                      |
//! |-------:|-------------:|-------------------------------|
//! | 0      | 8            | magic `lbamagic`              |
//! | 8      | 8            | padding (zero)                |
//! | 16     | 16 per entry | entries in append order       |
//!
//! The extent does not record how many entries it holds.  That count lives
//! in the metablock (for the last extent of a shard) or in the shard's
//! superblock (for sealed extents), and bytes past it are never
//! interpreted.

use binrw::binrw;
use logstore_storage::{block::BlockLocation, error::StorageError, BlockDevice};
use std::slice::ChunksExact;

use super::LbaEntry;
use crate::format::{
    decode, encode, FixedLen, StaticConfig, DEVICE_BLOCK_SIZE, LBA_MAGIC, LBA_SUPER_MAGIC_SIZE,
};
use crate::error::FormatError;

const STRUCTURE: &str = "LBA extent";

#[binrw]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LbaExtentHeader {
    pub magic: [u8; LBA_SUPER_MAGIC_SIZE],
    pub padding: [u8; 8],
}

impl FixedLen for LbaExtentHeader {
    const LEN: usize = 16;
}

impl LbaExtentHeader {
    pub const fn new() -> Self {
        Self {
            magic: LBA_MAGIC,
            padding: [0; 8],
        }
    }
}

impl Default for LbaExtentHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the number of bytes to read for an extent with `count` entries.
pub(crate) const fn extent_bytes(count: u64) -> u64 {
    LbaExtentHeader::LEN as u64 + count * LbaEntry::LEN as u64
}

/// Appends entries to one LBA extent.
///
/// Entries accumulate in memory until [`write`](Self::write) puts them on
/// the device.  The header goes out with the first write.
#[derive(Debug)]
pub struct LbaExtentWriter {
    offset: u64,
    capacity: u64,

    /// Entries already on the device.
    written: u64,

    /// Entries not yet on the device.
    pending: Vec<LbaEntry>,

    header_written: bool,
}

impl LbaExtentWriter {
    /// Starts a new, empty extent at `offset`.
    pub fn new(offset: u64, config: &StaticConfig) -> Self {
        Self {
            offset,
            capacity: config.lba_entries_per_extent(),
            written: 0,
            pending: Vec::new(),
            header_written: false,
        }
    }

    /// Continues an extent recovered from the device that already holds
    /// `count` entries.
    pub fn resume(offset: u64, count: u64, config: &StaticConfig) -> Self {
        Self {
            offset,
            capacity: config.lba_entries_per_extent(),
            written: count,
            pending: Vec::new(),
            header_written: true,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Total number of entries, including ones not yet written.
    pub fn count(&self) -> u64 {
        self.written + self.pending.len() as u64
    }

    /// Number of entries on the device.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.count() >= self.capacity
    }

    /// Appends `entry`, returning it back if the extent is full.
    pub fn push(&mut self, entry: LbaEntry) -> Result<(), LbaEntry> {
        if self.is_full() {
            return Err(entry);
        }
        self.pending.push(entry);
        Ok(())
    }

    /// Appends padding entries until the end of the entries falls on a
    /// device block boundary or the extent is full.  Does nothing if no
    /// entries are pending, so that repeated flushes of an idle extent
    /// don't consume space.
    pub fn pad_to_device_block(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        while extent_bytes(self.count()) % DEVICE_BLOCK_SIZE != 0 && !self.is_full() {
            self.pending.push(LbaEntry::make_padding_entry());
        }
    }

    /// Writes the header, if it has not been written yet, and all pending
    /// entries.  Does not sync.
    pub fn write(&mut self, device: &dyn BlockDevice) -> Result<(), StorageError> {
        let mut buffer = Vec::with_capacity(
            LbaExtentHeader::LEN + self.pending.len() * LbaEntry::LEN,
        );
        let start = if self.header_written {
            self.offset + extent_bytes(self.written)
        } else {
            buffer.extend(encode(&LbaExtentHeader::new()));
            self.offset
        };
        for entry in &self.pending {
            buffer.extend(encode(entry));
        }
        if buffer.is_empty() {
            return Ok(());
        }
        device.write_all_at(start, &buffer)?;
        self.header_written = true;
        self.written += self.pending.len() as u64;
        self.pending.clear();
        Ok(())
    }
}

/// Reads the header and first `count` entries of the LBA extent at `offset`.
///
/// Only the bytes that hold those entries are read, since the rest of the
/// extent may never have been written.
pub fn read_lba_extent(
    device: &dyn BlockDevice,
    config: &StaticConfig,
    offset: u64,
    count: u64,
) -> Result<Vec<u8>, crate::Error> {
    check_count(config, offset, count)?;
    let location = BlockLocation::new(offset, extent_bytes(count) as usize);
    Ok(device.read_exact_at(location)?)
}

fn check_count(config: &StaticConfig, offset: u64, count: u64) -> Result<(), FormatError> {
    let capacity = config.lba_entries_per_extent();
    if count > capacity {
        Err(FormatError::CountExceedsCapacity {
            structure: STRUCTURE,
            offset,
            count,
            capacity,
        })
    } else {
        Ok(())
    }
}

/// Decodes LBA extents from bytes read off the device.
#[derive(Debug, Clone, Copy)]
pub struct LbaExtentReader<'a> {
    bytes: &'a [u8],
    offset: u64,
}

impl<'a> LbaExtentReader<'a> {
    /// Checks the header of the extent in `bytes`, which were read from
    /// `offset`.
    pub fn new(bytes: &'a [u8], offset: u64) -> Result<Self, FormatError> {
        if bytes.len() < LbaExtentHeader::LEN {
            return Err(FormatError::Truncated {
                structure: STRUCTURE,
                offset,
                size: bytes.len() as u64,
                expected: LbaExtentHeader::LEN as u64,
            });
        }
        let header: LbaExtentHeader = decode(bytes)?;
        if header.magic != LBA_MAGIC {
            return Err(FormatError::BadMagic {
                structure: STRUCTURE,
                offset,
                expected: LBA_MAGIC,
                found: header.magic,
            });
        }
        Ok(Self { bytes, offset })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns an iterator over the first `count` entries, in append order.
    ///
    /// The iterator borrows the buffer, so the same extent can be scanned
    /// any number of times.
    pub fn scan(&self, count: u64) -> Result<LbaEntries<'a>, FormatError> {
        let needed = extent_bytes(count);
        if (self.bytes.len() as u64) < needed {
            return Err(FormatError::Truncated {
                structure: STRUCTURE,
                offset: self.offset,
                size: self.bytes.len() as u64,
                expected: needed,
            });
        }
        Ok(LbaEntries {
            chunks: self.bytes[LbaExtentHeader::LEN..needed as usize].chunks_exact(LbaEntry::LEN),
        })
    }
}

/// Iterator over the entries of an LBA extent.
#[derive(Debug, Clone)]
pub struct LbaEntries<'a> {
    chunks: ChunksExact<'a, u8>,
}

impl Iterator for LbaEntries<'_> {
    type Item = Result<LbaEntry, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.chunks.next().map(decode::<LbaEntry>)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use logstore_storage::{memory::MemoryDevice, BlockDevice};

    use super::{extent_bytes, read_lba_extent, LbaExtentHeader, LbaExtentReader, LbaExtentWriter};
    use crate::error::FormatError;
    use crate::format::{encode, FixedLen, Recency, StaticConfig};
    use crate::lba::LbaEntry;
    use crate::Error;

    const CONFIG: StaticConfig = StaticConfig::new(512, 12288);
    const EXTENT: u64 = 12288;

    #[test]
    fn header_layout() {
        let bytes = encode(&LbaExtentHeader::new());
        assert_eq!(bytes.len(), LbaExtentHeader::LEN);
        assert_eq!(&bytes[0..8], b"lbamagic");
        assert_eq!(&bytes[8..16], &[0; 8]);
        assert_eq!(extent_bytes(1), 32);
    }

    #[test]
    fn write_and_scan() {
        let device = MemoryDevice::new();
        let mut writer = LbaExtentWriter::new(EXTENT, &CONFIG);
        let entries: Vec<_> = (0..5)
            .map(|i| LbaEntry::live(i * 16, Recency(i), EXTENT * 2 + u64::from(i) * 512))
            .collect();
        for entry in &entries {
            writer.push(*entry).unwrap();
        }
        writer.write(&device).unwrap();
        assert_eq!(writer.written(), 5);

        // Second batch lands right after the first, with no second header.
        writer.push(LbaEntry::deletion(0, Recency(9))).unwrap();
        writer.write(&device).unwrap();
        assert_eq!(device.size().unwrap(), EXTENT + extent_bytes(6));

        let bytes = read_lba_extent(&device, &CONFIG, EXTENT, 6).unwrap();
        let reader = LbaExtentReader::new(&bytes, EXTENT).unwrap();
        let scanned: Vec<_> = reader.scan(6).unwrap().map(Result::unwrap).collect();
        assert_eq!(&scanned[..5], &entries[..]);
        assert_eq!(scanned[5], LbaEntry::deletion(0, Recency(9)));

        // Scanning is restartable and honors the count.
        assert_eq!(reader.scan(2).unwrap().count(), 2);
        assert_eq!(reader.scan(6).unwrap().count(), 6);
    }

    #[test]
    fn padding_aligns_tail() {
        let mut writer = LbaExtentWriter::new(EXTENT, &CONFIG);
        writer.pad_to_device_block();
        assert_eq!(writer.count(), 0);

        writer.push(LbaEntry::live(1, Recency(0), EXTENT * 2)).unwrap();
        writer.pad_to_device_block();
        assert_eq!(extent_bytes(writer.count()) % 512, 0);
        assert_eq!(writer.count(), 31);

        let device = MemoryDevice::new();
        writer.write(&device).unwrap();
        let bytes = read_lba_extent(&device, &CONFIG, EXTENT, 31).unwrap();
        let reader = LbaExtentReader::new(&bytes, EXTENT).unwrap();
        let padding = reader
            .scan(31)
            .unwrap()
            .filter(|entry| entry.as_ref().unwrap().is_padding())
            .count();
        assert_eq!(padding, 30);
    }

    #[test]
    fn full_extent() {
        let mut writer = LbaExtentWriter::new(EXTENT, &CONFIG);
        let capacity = CONFIG.lba_entries_per_extent();
        for i in 0..capacity {
            writer.push(LbaEntry::live(i as u32 * 16, Recency(0), 0)).unwrap();
        }
        assert!(writer.is_full());
        let entry = LbaEntry::deletion(1, Recency(0));
        assert_eq!(writer.push(entry), Err(entry));

        // Padding a full extent is a no-op.
        writer.pad_to_device_block();
        assert_eq!(writer.count(), capacity);
    }

    #[test]
    fn bad_input() {
        let device = MemoryDevice::new();
        assert!(matches!(
            read_lba_extent(&device, &CONFIG, EXTENT, CONFIG.lba_entries_per_extent() + 1),
            Err(Error::Format(FormatError::CountExceedsCapacity { .. }))
        ));
        assert!(matches!(
            LbaExtentReader::new(&[0; 64], EXTENT),
            Err(FormatError::BadMagic { .. })
        ));
        let header = encode(&LbaExtentHeader::new());
        let reader = LbaExtentReader::new(&header, EXTENT).unwrap();
        assert!(matches!(reader.scan(1), Err(FormatError::Truncated { .. })));
        assert_eq!(reader.scan(0).unwrap().count(), 0);
    }
}
