//! The LBA (logical block address) index.
//!
//! The index maps each block id to the device offset of the block's latest
//! version.  It lives in memory as an [`LbaIndex`] and on the device as a
//! log of [`LbaEntry`] records, split into [`LBA_SHARD_FACTOR`] independent
//! shards by `block_id % LBA_SHARD_FACTOR`.  Replaying a shard's log, in
//! order, reproduces that shard's part of the index.
//!
//! [`LBA_SHARD_FACTOR`]: crate::format::LBA_SHARD_FACTOR

mod entry;
mod extent;
mod index;
mod shard;
mod superblock;

pub use entry::LbaEntry;
pub use extent::{read_lba_extent, LbaEntries, LbaExtentHeader, LbaExtentReader, LbaExtentWriter};
pub use index::{BlockInfo, LbaIndex};
pub use shard::LbaShard;
pub use superblock::{
    decode_superblock, encode_superblock, read_lba_superblock, LbaSuperblockEntry,
    LbaSuperblockHeader,
};
