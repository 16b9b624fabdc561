//! Errors.
//!
//! [`FormatError`] describes a single on-disk structure that failed to
//! decode.  [`CorruptStore`] is what recovery reports when the store as a
//! whole cannot be brought back.  [`Error`] is the top-level error returned
//! by [`Store`](crate::Store) operations.

use binrw::Error as BinError;
use logstore_storage::error::StorageError;
use std::fmt::{Display, Formatter, Result as FmtResult};
use thiserror::Error as ThisError;

use crate::format::{BlockId, StaticConfig};

/// A structure read from the device is malformed.
#[derive(ThisError, Debug)]
pub enum FormatError {
    /// Magic number doesn't match the structure being read.
    #[error("{structure} at offset {offset} has bad magic {found:?} (expected {expected:?}).")]
    BadMagic {
        structure: &'static str,
        offset: u64,
        expected: [u8; 8],
        found: [u8; 8],
    },

    /// Checksum doesn't match the block's contents.
    #[error(
        "{structure} at offset {offset} has checksum {checksum:#x} but its contents have checksum {computed_checksum:#x}."
    )]
    InvalidChecksum {
        structure: &'static str,
        offset: u64,
        checksum: u32,
        computed_checksum: u32,
    },

    /// Format version is not one this code understands.
    #[error("{structure} at offset {offset} has version {version} (expected {expected_version}).")]
    InvalidVersion {
        structure: &'static str,
        offset: u64,
        version: u32,
        expected_version: u32,
    },

    /// An entry count is larger than the structure can hold.
    #[error("{structure} at offset {offset} claims {count} entries but holds at most {capacity}.")]
    CountExceedsCapacity {
        structure: &'static str,
        offset: u64,
        count: u64,
        capacity: u64,
    },

    /// Fewer bytes are available than the structure needs.
    #[error("{structure} at offset {offset} is {size} bytes long but {expected} are required.")]
    Truncated {
        structure: &'static str,
        offset: u64,
        size: u64,
        expected: u64,
    },

    /// A reference to another extent is not an extent start, points into
    /// the reserved extent, or is otherwise unusable.
    #[error("{structure} at offset {offset} refers to invalid offset {target:#x}.")]
    InvalidPointer {
        structure: &'static str,
        offset: u64,
        target: u64,
    },

    /// An LBA entry is stored in a shard other than the one its block id
    /// belongs to.
    #[error("LBA extent at offset {offset} for shard {shard} contains an entry for block {block_id}, which belongs to shard {expected_shard}.")]
    MisplacedEntry {
        offset: u64,
        shard: usize,
        block_id: BlockId,
        expected_shard: usize,
    },

    /// The static configuration recorded in the store is unusable.
    #[error("Invalid static configuration (block size {block_size}, extent size {extent_size}): {reason}.")]
    InvalidStaticConfig {
        block_size: u64,
        extent_size: u64,
        reason: &'static str,
    },

    /// Failed to decode a fixed layout, which includes invalid flagged
    /// offsets.
    #[error("Binary read/write error: {0}")]
    Binrw(#[from] BinError),
}

/// Status of one metablock slot, as found during recovery.
#[derive(Debug)]
pub enum SlotStatus {
    /// The slot holds a valid metablock with this sequence id.
    Valid { sequence_id: u64 },

    /// The slot failed validation.
    Invalid(FormatError),
}

impl Display for SlotStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            SlotStatus::Valid { sequence_id } => write!(f, "valid (sequence id {sequence_id})"),
            SlotStatus::Invalid(error) => write!(f, "invalid ({error})"),
        }
    }
}

/// The store's durable state cannot be recovered.
#[derive(ThisError, Debug)]
pub enum CorruptStore {
    /// Neither metablock slot is valid.
    #[error("No valid metablock: slot A is {slot_a}; slot B is {slot_b}.")]
    NoValidMetablock {
        slot_a: SlotStatus,
        slot_b: SlotStatus,
    },

    /// A structure reachable from the selected metablock is malformed.
    #[error("Replaying LBA shard {shard} from metablock {sequence_id} failed: {source}")]
    ShardReplay {
        shard: usize,
        sequence_id: u64,
        source: FormatError,
    },

    /// The structures decode but contradict each other.
    #[error("Store is inconsistent as of metablock {sequence_id}: {reason}")]
    Inconsistent { sequence_id: u64, reason: String },
}

/// Errors returned by store operations.
#[derive(ThisError, Debug)]
pub enum Error {
    /// A structure failed to decode outside recovery.
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    /// The store was created with different static parameters.
    #[error("Store was created with {found} but {expected} was requested.")]
    ConfigMismatch {
        expected: StaticConfig,
        found: StaticConfig,
    },

    /// Recovery failed.
    #[error("Corrupt store: {0}")]
    CorruptStore(#[from] CorruptStore),

    /// A request doesn't fit in a fixed-size structure.
    #[error("{what} is limited to {capacity} but {requested} was requested.")]
    CapacityExceeded {
        what: &'static str,
        requested: u64,
        capacity: u64,
    },

    /// The block id is reserved.
    #[error("Block id {0:#x} is reserved.")]
    InvalidBlockId(BlockId),

    /// The configuration is not usable.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// `create` was called on a device that already holds data.
    #[error("Cannot create a store on {device}, which already contains {size} bytes.")]
    DeviceNotEmpty { device: String, size: u64 },

    /// The device does not contain a store.
    #[error("{device} does not contain a store.")]
    Uninitialized { device: String },

    /// The device failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<BinError> for Error {
    fn from(value: BinError) -> Self {
        Self::Format(value.into())
    }
}
