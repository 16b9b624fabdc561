//! Recovery: rebuilding in-memory state from the durable metablock.
//!
//! Recovery is a small state machine:
//!
//! ```text
//! SelectMetablock -> ReplayShards -> ReconcileActiveExtents -> Ready
//!        |                |                    |
//!        +----------------+--------------------+--> CorruptStore
//! ```
//!
//! 1. Read both metablock slots and select the valid one with the larger
//!    sequence id.
//! 2. For each LBA shard, read its superblock (if any), then every sealed
//!    extent it lists in order, then the shard's last extent, folding each
//!    entry into the in-memory index.
//! 3. Check the data block manager's active extents and the index against
//!    each other and compute the set of extents in use.
//!
//! Each step is a function over bytes read from the device, so the steps can
//! be exercised on hand-built images.  Nothing is written during recovery.

use std::collections::{BTreeMap, BTreeSet};

use logstore_storage::{error::StorageError, BlockDevice};
use tracing::{debug, info, warn};

use crate::error::{CorruptStore, Error, FormatError};
use crate::format::{shard_of, StaticConfig, LBA_SHARD_FACTOR, NULL_BLOCK_ID, NULL_OFFSET};
use crate::lba::{
    decode_superblock, read_lba_extent, read_lba_superblock, LbaExtentReader, LbaIndex,
    LbaSuperblockEntry,
};
use crate::metablock::{
    read_slots, select, LbaShardMetablock, Metablock, MetablockSlot,
};

/// Where recovery is.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RecoveryState {
    SelectMetablock,
    ReplayShards,
    ReconcileActiveExtents,
    Ready,
    CorruptStore,
}

/// A shard's durable log, as recovered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveredShard {
    pub metablock: LbaShardMetablock,

    /// Sealed extents listed by the shard's superblock, oldest first.
    pub sealed: Vec<LbaSuperblockEntry>,
}

impl RecoveredShard {
    /// Returns the offsets of every extent the shard's log occupies.
    pub fn extents(&self) -> impl Iterator<Item = u64> + '_ {
        let last = self.metablock.last_lba_extent_offset;
        let superblock = self.metablock.lba_superblock_offset;
        self.sealed
            .iter()
            .map(|entry| entry.offset)
            .chain([last, superblock].into_iter().filter(|offset| *offset != NULL_OFFSET))
    }
}

/// Everything recovery produces.
#[derive(Clone, Debug)]
pub struct Recovered {
    pub slot: MetablockSlot,
    pub metablock: Metablock,
    pub index: LbaIndex,
    pub shards: Vec<RecoveredShard>,

    /// Every extent in use, including extent 0.
    pub extents_in_use: BTreeSet<u64>,
}

pub struct Recovery<'a> {
    device: &'a dyn BlockDevice,
    config: StaticConfig,
    state: RecoveryState,
}

impl<'a> Recovery<'a> {
    /// Prepares to recover the store on `device`, whose static header
    /// records `config`.
    pub fn new(device: &'a dyn BlockDevice, config: StaticConfig) -> Self {
        Self {
            device,
            config,
            state: RecoveryState::SelectMetablock,
        }
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    fn transition(&mut self, next: RecoveryState) {
        debug!("recovery: {:?} -> {next:?}", self.state);
        self.state = next;
    }

    /// Runs recovery to completion.
    ///
    /// Afterward, [`state`](Self::state) is [`RecoveryState::Ready`] on
    /// success and [`RecoveryState::CorruptStore`] if the durable state is
    /// damaged.  An I/O error leaves the state where it failed.
    pub fn run(&mut self) -> Result<Recovered, Error> {
        let result = self.run_steps();
        if let Err(Error::CorruptStore(error)) = &result {
            warn!("recovery of {} failed: {error}", self.device.describe());
            self.transition(RecoveryState::CorruptStore);
        }
        result
    }

    fn run_steps(&mut self) -> Result<Recovered, Error> {
        let [slot_a, slot_b] = read_slots(self.device)?;
        let selected = select(&slot_a, &slot_b)?;
        let metablock = selected.metablock;
        let sequence_id = metablock.block_sequence_id;
        info!(
            "recovering {} from metablock {sequence_id} in slot {:?}",
            self.device.describe(),
            selected.slot
        );
        self.transition(RecoveryState::ReplayShards);

        let mut index = LbaIndex::new();
        let mut shards = Vec::with_capacity(LBA_SHARD_FACTOR);
        for (shard, shard_metablock) in metablock.lba_index_part.shards.iter().enumerate() {
            let sealed = replay_shard(self.device, &self.config, shard, shard_metablock, &mut index)
                .map_err(|error| shard_error(error, shard, sequence_id))?;
            shards.push(RecoveredShard {
                metablock: *shard_metablock,
                sealed,
            });
        }
        self.transition(RecoveryState::ReconcileActiveExtents);

        let device_size = self.device.size()?;
        let extents_in_use = reconcile(&self.config, &metablock, &index, &shards, device_size)?;
        self.transition(RecoveryState::Ready);
        info!(
            "recovered {} blocks in {} extents",
            index.len(),
            extents_in_use.len()
        );

        Ok(Recovered {
            slot: selected.slot,
            metablock,
            index,
            shards,
            extents_in_use,
        })
    }
}

/// Converts an error replaying `shard` into [`CorruptStore::ShardReplay`]
/// when it reflects damage rather than a failing device.
fn shard_error(error: Error, shard: usize, sequence_id: u64) -> Error {
    let source = match error {
        Error::Format(source) => source,
        Error::Storage(StorageError::ShortRead { location, size }) => FormatError::Truncated {
            structure: "LBA extent",
            offset: location.offset,
            size: size.saturating_sub(location.offset),
            expected: location.size as u64,
        },
        other => return other,
    };
    CorruptStore::ShardReplay {
        shard,
        sequence_id,
        source,
    }
    .into()
}

/// Checks that `offset` and `count` from a metablock describe an extent or
/// are both null.
fn check_extent_pointer(
    config: &StaticConfig,
    structure: &'static str,
    offset: u64,
    count: u64,
) -> Result<bool, FormatError> {
    if offset == NULL_OFFSET {
        if count != 0 {
            return Err(FormatError::CountExceedsCapacity {
                structure,
                offset,
                count,
                capacity: 0,
            });
        }
        Ok(false)
    } else if config.is_extent_start(offset) {
        Ok(true)
    } else {
        Err(FormatError::InvalidPointer {
            structure: "metablock",
            offset: 0,
            target: offset,
        })
    }
}

/// Replays one shard's log from the device into `index` and returns the
/// shard's sealed extents.
pub fn replay_shard(
    device: &dyn BlockDevice,
    config: &StaticConfig,
    shard: usize,
    metablock: &LbaShardMetablock,
    index: &mut LbaIndex,
) -> Result<Vec<LbaSuperblockEntry>, Error> {
    let has_superblock = check_extent_pointer(
        config,
        "LBA superblock",
        metablock.lba_superblock_offset,
        metablock.lba_superblock_entries_count,
    )?;
    let has_last = check_extent_pointer(
        config,
        "LBA extent",
        metablock.last_lba_extent_offset,
        metablock.last_lba_extent_entries_count,
    )?;

    let sealed = if has_superblock {
        let offset = metablock.lba_superblock_offset;
        let count = metablock.lba_superblock_entries_count;
        let bytes = read_lba_superblock(device, config, offset, count)?;
        decode_superblock(&bytes, offset, count, config)?
    } else {
        Vec::new()
    };

    let last = has_last.then_some(LbaSuperblockEntry {
        offset: metablock.last_lba_extent_offset,
        lba_entries_count: metablock.last_lba_extent_entries_count,
    });
    for extent in sealed.iter().chain(last.iter()) {
        let bytes = read_lba_extent(device, config, extent.offset, extent.lba_entries_count)?;
        fold_extent(
            &bytes,
            extent.offset,
            extent.lba_entries_count,
            shard,
            config,
            index,
        )?;
    }
    debug!(
        "LBA shard {shard}: replayed {} sealed extents",
        sealed.len()
    );
    Ok(sealed)
}

/// Folds the first `count` entries of the LBA extent in `bytes`, read from
/// `offset`, into `index`.  Every entry must belong to `shard`.
pub fn fold_extent(
    bytes: &[u8],
    offset: u64,
    count: u64,
    shard: usize,
    config: &StaticConfig,
    index: &mut LbaIndex,
) -> Result<(), FormatError> {
    let reader = LbaExtentReader::new(bytes, offset)?;
    for entry in reader.scan(count)? {
        let entry = entry?;
        if entry.is_padding() {
            continue;
        }
        if entry.block_id == NULL_BLOCK_ID {
            return Err(FormatError::InvalidPointer {
                structure: "LBA extent",
                offset,
                target: entry.offset.raw(),
            });
        }
        let expected_shard = shard_of(entry.block_id);
        if expected_shard != shard {
            return Err(FormatError::MisplacedEntry {
                offset,
                shard,
                block_id: entry.block_id,
                expected_shard,
            });
        }
        if let Some(target) = entry.offset.value() {
            if target % config.block_size != 0 || target < config.extent_size {
                return Err(FormatError::InvalidPointer {
                    structure: "LBA extent",
                    offset,
                    target,
                });
            }
        }
        index.apply(&entry);
    }
    Ok(())
}

/// Cross-checks the recovered index, LBA extents, and active data extents,
/// and returns the set of extents in use.
pub fn reconcile(
    config: &StaticConfig,
    metablock: &Metablock,
    index: &LbaIndex,
    shards: &[RecoveredShard],
    device_size: u64,
) -> Result<BTreeSet<u64>, CorruptStore> {
    let sequence_id = metablock.block_sequence_id;
    let inconsistent = |reason: String| CorruptStore::Inconsistent {
        sequence_id,
        reason,
    };

    let mut in_use = BTreeSet::from([0]);
    let mut lba_extents = BTreeSet::new();
    for (shard, recovered) in shards.iter().enumerate() {
        for offset in recovered.extents() {
            if !lba_extents.insert(offset) {
                return Err(inconsistent(format!(
                    "LBA shard {shard} uses extent {offset} that is already in use"
                )));
            }
        }
    }
    in_use.extend(lba_extents.iter().copied());

    let dbm = &metablock.data_block_manager_part;
    let mut active = BTreeMap::new();
    for (slot, (&offset, &blocks)) in dbm
        .active_extents
        .iter()
        .zip(dbm.blocks_in_active_extent.iter())
        .enumerate()
    {
        if offset == NULL_OFFSET {
            if blocks != 0 {
                return Err(inconsistent(format!(
                    "unused active extent slot {slot} records {blocks} blocks"
                )));
            }
            continue;
        }
        if !config.is_extent_start(offset) {
            return Err(inconsistent(format!(
                "active extent slot {slot} refers to invalid offset {offset:#x}"
            )));
        }
        if blocks > config.blocks_per_extent() {
            return Err(inconsistent(format!(
                "active extent {offset} records {blocks} blocks but holds at most {}",
                config.blocks_per_extent()
            )));
        }
        if offset.saturating_add(blocks * config.block_size) > device_size {
            return Err(inconsistent(format!(
                "active extent {offset} records {blocks} blocks but the device ends at {device_size}"
            )));
        }
        if lba_extents.contains(&offset) || active.insert(offset, blocks).is_some() {
            return Err(inconsistent(format!(
                "active extent {offset} is already in use"
            )));
        }
    }
    in_use.extend(active.keys().copied());

    for (block_id, info) in index.iter() {
        let extent = config.extent_of(info.offset);
        if lba_extents.contains(&extent) {
            return Err(inconsistent(format!(
                "block {block_id} at offset {} lies in LBA extent {extent}",
                info.offset
            )));
        }
        if info.offset + config.block_size > device_size {
            return Err(inconsistent(format!(
                "block {block_id} at offset {} lies past the end of the device ({device_size} bytes)",
                info.offset
            )));
        }
        if let Some(&blocks) = active.get(&extent) {
            let position = (info.offset - extent) / config.block_size;
            if position >= blocks {
                return Err(inconsistent(format!(
                    "block {block_id} at offset {} lies past the {blocks} blocks written to active extent {extent}",
                    info.offset
                )));
            }
        }
        in_use.insert(extent);
    }

    let recorded = metablock.extent_manager_part.debug_extents_in_use;
    let found = in_use.len() as u64;
    if found > recorded {
        warn!("metablock {sequence_id} records {recorded} extents in use but {found} are referenced");
    } else if found < recorded {
        info!("reclaiming {} unreferenced extents", recorded - found);
    }
    Ok(in_use)
}
