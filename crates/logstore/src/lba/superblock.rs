//! LBA superblocks.
//!
//! Each shard that has sealed (filled) LBA extents lists them, oldest
//! first, in a superblock that occupies an extent of its own:
//!
//! | Offset | Size         | Contents                      |
//! |-------:|-------------:|-------------------------------|
//! | 0      | 8            | magic `lbasuper`              |
//! | 8      | 8            | padding (zero)                |
//! | 16     | 16 per entry | [`LbaSuperblockEntry`] list   |
//!
//! A superblock is never modified in place.  When a shard's list of sealed
//! extents changes, the next checkpoint writes a complete new superblock to
//! a fresh extent.

use binrw::binrw;
use logstore_storage::{block::BlockLocation, BlockDevice};

use super::extent::extent_bytes;
use crate::error::FormatError;
use crate::format::{decode, encode, FixedLen, StaticConfig, LBA_SUPER_MAGIC, LBA_SUPER_MAGIC_SIZE};

const STRUCTURE: &str = "LBA superblock";

/// One sealed LBA extent and the number of entries it holds.
#[binrw]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LbaSuperblockEntry {
    pub offset: u64,
    pub lba_entries_count: u64,
}

impl FixedLen for LbaSuperblockEntry {
    const LEN: usize = 16;
}

#[binrw]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LbaSuperblockHeader {
    pub magic: [u8; LBA_SUPER_MAGIC_SIZE],
    pub padding: [u8; 8],
}

impl FixedLen for LbaSuperblockHeader {
    const LEN: usize = 16;
}

/// Encodes a superblock listing `entries`.
pub fn encode_superblock(entries: &[LbaSuperblockEntry]) -> Vec<u8> {
    let mut bytes = encode(&LbaSuperblockHeader {
        magic: LBA_SUPER_MAGIC,
        padding: [0; 8],
    });
    for entry in entries {
        bytes.extend(encode(entry));
    }
    bytes
}

/// Reads the superblock at `offset` that holds `count` entries.
pub fn read_lba_superblock(
    device: &dyn BlockDevice,
    config: &StaticConfig,
    offset: u64,
    count: u64,
) -> Result<Vec<u8>, crate::Error> {
    let capacity = config.lba_entries_per_extent();
    if count > capacity {
        return Err(FormatError::CountExceedsCapacity {
            structure: STRUCTURE,
            offset,
            count,
            capacity,
        }
        .into());
    }
    let location = BlockLocation::new(offset, extent_bytes(count) as usize);
    Ok(device.read_exact_at(location)?)
}

/// Decodes the first `count` entries of the superblock in `bytes`, read from
/// `offset`, and checks that each one describes a plausible LBA extent.
pub fn decode_superblock(
    bytes: &[u8],
    offset: u64,
    count: u64,
    config: &StaticConfig,
) -> Result<Vec<LbaSuperblockEntry>, FormatError> {
    let needed = extent_bytes(count);
    if (bytes.len() as u64) < needed {
        return Err(FormatError::Truncated {
            structure: STRUCTURE,
            offset,
            size: bytes.len() as u64,
            expected: needed,
        });
    }
    let header: LbaSuperblockHeader = decode(bytes)?;
    if header.magic != LBA_SUPER_MAGIC {
        return Err(FormatError::BadMagic {
            structure: STRUCTURE,
            offset,
            expected: LBA_SUPER_MAGIC,
            found: header.magic,
        });
    }

    let capacity = config.lba_entries_per_extent();
    bytes[LbaSuperblockHeader::LEN..needed as usize]
        .chunks_exact(LbaSuperblockEntry::LEN)
        .map(|chunk| {
            let entry: LbaSuperblockEntry = decode(chunk)?;
            if !config.is_extent_start(entry.offset) {
                return Err(FormatError::InvalidPointer {
                    structure: STRUCTURE,
                    offset,
                    target: entry.offset,
                });
            }
            if entry.lba_entries_count > capacity {
                return Err(FormatError::CountExceedsCapacity {
                    structure: "LBA extent",
                    offset: entry.offset,
                    count: entry.lba_entries_count,
                    capacity,
                });
            }
            Ok(entry)
        })
        .collect()
}
