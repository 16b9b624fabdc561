//! On-disk format.
//!
//! A store occupies a single device divided into extents of
//! [`StaticConfig::extent_size`] bytes.  Extent 0 is reserved:
//!
//! | Offset | Size | Contents                                       |
//! |-------:|-----:|------------------------------------------------|
//! | 0      | 4096 | static header ([`StaticHeader`])               |
//! | 4096   | 4096 | metablock slot A ([`crate::metablock`])        |
//! | 8192   | 4096 | metablock slot B                               |
//!
//! Every other extent holds either data blocks, LBA entries (see
//! [`crate::lba`]), or one LBA superblock.
//!
//! All integers are stored little-endian.  Every structure has a fixed
//! encoded size, given by [`FixedLen::LEN`], and a fixed field layout.
//! Field offsets are checked by the tests in each module.

use binrw::{binrw, BinRead, BinWrite};
use std::io::Cursor;

use crate::error::FormatError;

mod block;
mod offset;
mod static_config;

pub use block::BlockHeader;
pub(crate) use block::{open_block, seal_block};
pub use offset::FlaggedOffset;
pub use static_config::{StaticConfig, StaticHeader};

/// Number of independent shards the LBA index is split into.  A block id
/// belongs to shard `block_id % LBA_SHARD_FACTOR`.
pub const LBA_SHARD_FACTOR: usize = 16;

/// Maximum number of data extents that accept appends concurrently.
pub const MAX_ACTIVE_DATA_EXTENTS: usize = 64;

/// Size of the magic at the start of LBA extents and superblocks.
pub const LBA_SUPER_MAGIC_SIZE: usize = 8;

/// Alignment unit for writes of LBA extent tails, and the granularity of
/// [`StaticConfig::block_size`].
pub const DEVICE_BLOCK_SIZE: u64 = 512;

/// Size of the static header block at offset 0.
pub const STATIC_HEADER_SIZE: usize = 4096;

/// Size of one metablock slot.
pub const METABLOCK_SLOT_SIZE: usize = 4096;

/// Byte offsets of metablock slots A and B.
pub const METABLOCK_SLOT_OFFSETS: [u64; 2] = [4096, 8192];

/// Bytes at the start of extent 0 that the store owns.  Extents must be at
/// least this large.
pub const RESERVED_SIZE: u64 = (STATIC_HEADER_SIZE + 2 * METABLOCK_SLOT_SIZE) as u64;

/// Sentinel for "no extent" in metablock offset fields.
pub const NULL_OFFSET: u64 = u64::MAX;

/// Reserved block id, never assigned to a real block.
pub const NULL_BLOCK_ID: BlockId = u32::MAX;

/// Format version written into checksummed blocks.
pub const VERSION_NUMBER: u32 = 1;

pub const STATIC_HEADER_MAGIC: [u8; 8] = *b"logstore";
pub const METABLOCK_MAGIC: [u8; 8] = *b"metablck";
pub const LBA_MAGIC: [u8; LBA_SUPER_MAGIC_SIZE] = *b"lbamagic";
pub const LBA_SUPER_MAGIC: [u8; LBA_SUPER_MAGIC_SIZE] = *b"lbasuper";

/// Logical block identifier.
pub type BlockId = u32;

/// Version stamp of a block's contents, chosen by the caller.
///
/// Recencies are opaque to the store.  It records them and hands them back
/// but never orders entries by them: the log order is authoritative.
#[binrw]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Recency(pub u32);

impl Recency {
    /// The "no recency" value.
    pub const INVALID: Recency = Recency(u32::MAX);

    pub const fn is_valid(&self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl FixedLen for Recency {
    const LEN: usize = 4;
}

/// A structure with a fixed encoded size.
pub trait FixedLen {
    /// Encoded size in bytes.
    const LEN: usize;
}

/// Returns the LBA shard that `block_id` belongs to.
pub const fn shard_of(block_id: BlockId) -> usize {
    block_id as usize % LBA_SHARD_FACTOR
}

/// Encodes `value` little-endian.
pub(crate) fn encode<T>(value: &T) -> Vec<u8>
where
    T: for<'a> BinWrite<Args<'a> = ()> + FixedLen,
{
    let mut cursor = Cursor::new(Vec::with_capacity(T::LEN));
    value
        .write_le(&mut cursor)
        .expect("writing to a Vec cannot fail");
    debug_assert_eq!(cursor.get_ref().len(), T::LEN);
    cursor.into_inner()
}

/// Decodes a little-endian `T` from the start of `bytes`.
pub(crate) fn decode<T>(bytes: &[u8]) -> Result<T, FormatError>
where
    T: for<'a> BinRead<Args<'a> = ()> + FixedLen,
{
    Ok(T::read_le(&mut Cursor::new(bytes))?)
}
