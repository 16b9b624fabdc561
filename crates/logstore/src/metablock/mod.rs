//! Metablocks.
//!
//! A metablock is the root of the store's durable state.  It records, for
//! each subsystem, exactly what recovery needs to rebuild it, plus a
//! sequence id that increases by one with each metablock written.
//!
//! Metablocks are written alternately to two slots in extent 0, so that a
//! write torn by a crash can only damage the newer slot.  Each slot is a
//! checksummed block:
//!
//! | Offset | Size | Field                          |
//! |-------:|-----:|--------------------------------|
//! | 0      | 4    | checksum                       |
//! | 4      | 4    | version                        |
//! | 8      | 8    | magic `metablck`               |
//! | 16     | 1552 | [`Metablock`]                  |
//! | 1568   |      | zero padding to 4096 bytes     |

use binrw::binrw;
use static_assertions::const_assert_eq;
use tracing::warn;

use crate::error::{CorruptStore, FormatError, SlotStatus};
use crate::format::{
    decode, encode, open_block, seal_block, FixedLen, LBA_SHARD_FACTOR, MAX_ACTIVE_DATA_EXTENTS,
    METABLOCK_MAGIC, METABLOCK_SLOT_OFFSETS, METABLOCK_SLOT_SIZE, NULL_OFFSET,
};

mod manager;

pub use manager::{read_slots, MetablockManager};

/// Where one LBA shard's log lives.
///
/// | Offset | Size | Field                           |
/// |-------:|-----:|---------------------------------|
/// | 0      | 8    | `last_lba_extent_offset`        |
/// | 8      | 8    | `last_lba_extent_entries_count` |
/// | 16     | 8    | `lba_superblock_offset`         |
/// | 24     | 8    | `lba_superblock_entries_count`  |
#[binrw]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LbaShardMetablock {
    /// Extent receiving appends, or [`NULL_OFFSET`].
    pub last_lba_extent_offset: u64,

    /// Number of valid entries in that extent.
    pub last_lba_extent_entries_count: u64,

    /// Superblock listing the sealed extents, or [`NULL_OFFSET`].
    pub lba_superblock_offset: u64,

    /// Number of entries in the superblock.
    pub lba_superblock_entries_count: u64,
}

impl FixedLen for LbaShardMetablock {
    const LEN: usize = 32;
}

impl LbaShardMetablock {
    /// Describes a shard with no log at all.
    pub const fn empty() -> Self {
        Self {
            last_lba_extent_offset: NULL_OFFSET,
            last_lba_extent_entries_count: 0,
            lba_superblock_offset: NULL_OFFSET,
            lba_superblock_entries_count: 0,
        }
    }
}

#[binrw]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LbaMetablockMixin {
    pub shards: [LbaShardMetablock; LBA_SHARD_FACTOR],
}

impl FixedLen for LbaMetablockMixin {
    const LEN: usize = LbaShardMetablock::LEN * LBA_SHARD_FACTOR;
}

impl LbaMetablockMixin {
    pub const fn empty() -> Self {
        Self {
            shards: [LbaShardMetablock::empty(); LBA_SHARD_FACTOR],
        }
    }
}

/// The data extents accepting appends and how many blocks each holds.
///
/// Unused slots have [`NULL_OFFSET`] and a count of 0.
#[binrw]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DataBlockManagerMixin {
    pub active_extents: [u64; MAX_ACTIVE_DATA_EXTENTS],
    pub blocks_in_active_extent: [u64; MAX_ACTIVE_DATA_EXTENTS],
}

impl FixedLen for DataBlockManagerMixin {
    const LEN: usize = 2 * 8 * MAX_ACTIVE_DATA_EXTENTS;
}

impl DataBlockManagerMixin {
    pub const fn empty() -> Self {
        Self {
            active_extents: [NULL_OFFSET; MAX_ACTIVE_DATA_EXTENTS],
            blocks_in_active_extent: [0; MAX_ACTIVE_DATA_EXTENTS],
        }
    }

    /// Iterates over the `(offset, blocks)` pairs of the slots in use.
    pub fn active(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.active_extents
            .iter()
            .zip(self.blocks_in_active_extent.iter())
            .filter(|(offset, _)| **offset != NULL_OFFSET)
            .map(|(offset, blocks)| (*offset, *blocks))
    }
}

#[binrw]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExtentManagerMixin {
    /// Number of extents in use, including extent 0.  Recovery recomputes
    /// this and only uses the recorded value as a cross-check.
    pub debug_extents_in_use: u64,
}

impl FixedLen for ExtentManagerMixin {
    const LEN: usize = 8;
}

/// The store's durable root.
///
/// | Offset | Size | Field                     |
/// |-------:|-----:|---------------------------|
/// | 0      | 8    | `extent_manager_part`     |
/// | 8      | 512  | `lba_index_part`          |
/// | 520    | 1024 | `data_block_manager_part` |
/// | 1544   | 8    | `block_sequence_id`       |
#[binrw]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Metablock {
    pub extent_manager_part: ExtentManagerMixin,
    pub lba_index_part: LbaMetablockMixin,
    pub data_block_manager_part: DataBlockManagerMixin,
    pub block_sequence_id: u64,
}

impl FixedLen for Metablock {
    const LEN: usize = ExtentManagerMixin::LEN
        + LbaMetablockMixin::LEN
        + DataBlockManagerMixin::LEN
        + 8;
}

const_assert_eq!(LbaMetablockMixin::LEN, 512);
const_assert_eq!(DataBlockManagerMixin::LEN, 1024);
const_assert_eq!(Metablock::LEN, 1552);

impl Metablock {
    /// Returns the metablock of a freshly created store, before a sequence
    /// id is assigned.
    pub const fn empty() -> Self {
        Self {
            extent_manager_part: ExtentManagerMixin {
                debug_extents_in_use: 1,
            },
            lba_index_part: LbaMetablockMixin::empty(),
            data_block_manager_part: DataBlockManagerMixin::empty(),
            block_sequence_id: 0,
        }
    }

    /// Encodes `self` as a complete slot.
    pub fn encode_slot(&self) -> Vec<u8> {
        seal_block(METABLOCK_MAGIC, &encode(self), METABLOCK_SLOT_SIZE)
    }

    /// Decodes and validates the slot in `block`, read from `offset`.
    pub fn decode_slot(block: &[u8], offset: u64) -> Result<Self, FormatError> {
        let body = open_block("metablock", METABLOCK_MAGIC, block, offset)?;
        decode(body)
    }
}

/// One of the two metablock slots.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MetablockSlot {
    A,
    B,
}

impl MetablockSlot {
    pub const fn offset(self) -> u64 {
        match self {
            MetablockSlot::A => METABLOCK_SLOT_OFFSETS[0],
            MetablockSlot::B => METABLOCK_SLOT_OFFSETS[1],
        }
    }

    pub const fn other(self) -> Self {
        match self {
            MetablockSlot::A => MetablockSlot::B,
            MetablockSlot::B => MetablockSlot::A,
        }
    }
}

/// The metablock recovery starts from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SelectedMetablock {
    pub slot: MetablockSlot,
    pub metablock: Metablock,
}

/// Decodes both slots and returns the valid metablock with the larger
/// sequence id.
pub fn select(slot_a: &[u8], slot_b: &[u8]) -> Result<SelectedMetablock, CorruptStore> {
    let a = Metablock::decode_slot(slot_a, MetablockSlot::A.offset());
    let b = Metablock::decode_slot(slot_b, MetablockSlot::B.offset());
    match (a, b) {
        (Ok(a), Ok(b)) => {
            if a.block_sequence_id == b.block_sequence_id {
                warn!(
                    "both metablock slots have sequence id {}, using slot A",
                    a.block_sequence_id
                );
            }
            Ok(if b.block_sequence_id > a.block_sequence_id {
                SelectedMetablock {
                    slot: MetablockSlot::B,
                    metablock: b,
                }
            } else {
                SelectedMetablock {
                    slot: MetablockSlot::A,
                    metablock: a,
                }
            })
        }
        (Ok(a), Err(error)) => {
            warn!("metablock slot B is invalid, using slot A: {error}");
            Ok(SelectedMetablock {
                slot: MetablockSlot::A,
                metablock: a,
            })
        }
        (Err(error), Ok(b)) => {
            warn!("metablock slot A is invalid, using slot B: {error}");
            Ok(SelectedMetablock {
                slot: MetablockSlot::B,
                metablock: b,
            })
        }
        (Err(a), Err(b)) => Err(CorruptStore::NoValidMetablock {
            slot_a: SlotStatus::Invalid(a),
            slot_b: SlotStatus::Invalid(b),
        }),
    }
}

/// Describes a slot without failing, for diagnostics.
pub fn slot_status(block: &[u8], slot: MetablockSlot) -> SlotStatus {
    match Metablock::decode_slot(block, slot.offset()) {
        Ok(metablock) => SlotStatus::Valid {
            sequence_id: metablock.block_sequence_id,
        },
        Err(error) => SlotStatus::Invalid(error),
    }
}

#[cfg(test)]
mod tests;
