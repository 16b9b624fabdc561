//! The block store.
//!
//! [`Store`] ties the pieces together.  Appending a block writes its data
//! to an active data extent, then logs an LBA entry for it in the block's
//! shard and updates the in-memory index.  Nothing is durable until
//! [`Store::checkpoint`], which writes out the LBA logs, syncs, and then
//! writes and syncs a new metablock.  After a crash, [`Store::open`] comes
//! back with exactly the state as of the last completed checkpoint.
//!
//! # Locking
//!
//! Each LBA shard, the data block manager, the extent manager, and the
//! metablock manager sit behind their own mutex, and the index behind a
//! read-write lock.  Locks are always acquired in this order:
//!
//! 1. metablock manager
//! 2. shards, in ascending order
//! 3. data block manager
//! 4. extent manager
//! 5. index
//!
//! Appends to different shards therefore only contend briefly on the data
//! block manager and extent manager, and a checkpoint excludes all writers
//! while it runs.

use logstore_storage::{
    block::BlockLocation,
    error::StorageError,
    metrics::{CHECKPOINTS, CHECKPOINT_LATENCY},
    BlockDevice,
};
use logstore_types::config::StoreConfig;
use metrics::{counter, histogram};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::data_block::DataBlockManager;
use crate::error::{Error, FormatError};
use crate::extent_manager::ExtentManager;
use crate::format::{
    shard_of, BlockId, Recency, StaticConfig, StaticHeader, LBA_SHARD_FACTOR,
    MAX_ACTIVE_DATA_EXTENTS, NULL_BLOCK_ID, RESERVED_SIZE, STATIC_HEADER_SIZE,
};
use crate::lba::{BlockInfo, LbaEntry, LbaIndex, LbaShard};
use crate::metablock::{LbaMetablockMixin, Metablock, MetablockManager};
use crate::recovery::Recovery;

/// Summary statistics, for monitoring and tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of blocks with a live LBA entry.
    pub live_blocks: usize,

    /// Number of extents allocated, including extent 0.
    pub extents_in_use: u64,

    /// Sequence id of the last durable metablock.
    pub sequence_id: u64,

    /// Sealed LBA extents, summed over all shards.
    pub sealed_lba_extents: usize,

    /// Number of data extents accepting appends.
    pub active_data_extents: usize,
}

/// Tunables that are not part of the on-disk format.
#[derive(Copy, Clone, Debug)]
struct Options {
    active_data_extents: usize,
    compaction_threshold: usize,
}

impl Options {
    fn new(config: &StoreConfig, static_config: &StaticConfig) -> Result<Self, Error> {
        if !(1..=MAX_ACTIVE_DATA_EXTENTS).contains(&config.active_data_extents) {
            return Err(Error::InvalidConfig(format!(
                "active_data_extents must be between 1 and {MAX_ACTIVE_DATA_EXTENTS}, not {}",
                config.active_data_extents
            )));
        }
        if config.lba_compaction_threshold == 0 {
            return Err(Error::InvalidConfig(String::from(
                "lba_compaction_threshold must be at least 1",
            )));
        }
        let capacity = static_config.lba_entries_per_extent() as usize;
        let compaction_threshold = if config.lba_compaction_threshold > capacity {
            warn!(
                "lba_compaction_threshold {} exceeds superblock capacity {capacity}, using {capacity}",
                config.lba_compaction_threshold
            );
            capacity
        } else {
            config.lba_compaction_threshold
        };
        Ok(Self {
            active_data_extents: config.active_data_extents,
            compaction_threshold,
        })
    }
}

/// A log-structured block store.
pub struct Store {
    device: Arc<dyn BlockDevice>,
    config: StaticConfig,
    metablocks: Mutex<MetablockManager>,
    shards: Vec<Mutex<LbaShard>>,
    data: Mutex<DataBlockManager>,
    extents: Mutex<ExtentManager>,
    index: RwLock<LbaIndex>,
}

impl Store {
    /// Creates a new store on `device`, which must be empty.
    ///
    /// On success, the store is durable with sequence id 1.
    pub fn create(device: Arc<dyn BlockDevice>, config: &StoreConfig) -> Result<Self, Error> {
        let static_config = StaticConfig::from(config);
        static_config.validate()?;
        let options = Options::new(config, &static_config)?;

        let size = device.size()?;
        if size != 0 {
            return Err(Error::DeviceNotEmpty {
                device: device.describe(),
                size,
            });
        }

        let mut reserved = vec![0; RESERVED_SIZE as usize];
        reserved[..STATIC_HEADER_SIZE].copy_from_slice(&StaticHeader::encode(&static_config));
        device.write_all_at(0, &reserved)?;
        device.sync()?;

        let store = Self {
            config: static_config,
            metablocks: Mutex::new(MetablockManager::new()),
            shards: (0..LBA_SHARD_FACTOR)
                .map(|shard| {
                    Mutex::new(LbaShard::new(
                        shard,
                        &static_config,
                        options.compaction_threshold,
                    ))
                })
                .collect(),
            data: Mutex::new(DataBlockManager::new(
                &static_config,
                options.active_data_extents,
            )),
            extents: Mutex::new(ExtentManager::new(&static_config)),
            index: RwLock::new(LbaIndex::new()),
            device,
        };
        store.checkpoint()?;
        info!(
            "created store on {} with {static_config}",
            store.device.describe()
        );
        Ok(store)
    }

    /// Opens the existing store on `device`, recovering its state as of
    /// the last durable metablock.
    ///
    /// Fails with [`Error::ConfigMismatch`] if the store was created with a
    /// different block or extent size than `config` asks for.
    pub fn open(device: Arc<dyn BlockDevice>, config: &StoreConfig) -> Result<Self, Error> {
        let expected = StaticConfig::from(config);
        expected.validate()?;
        let options = Options::new(config, &expected)?;

        let size = device.size()?;
        if size == 0 {
            return Err(Error::Uninitialized {
                device: device.describe(),
            });
        }
        let header = device
            .read_exact_at(BlockLocation::new(0, STATIC_HEADER_SIZE))
            .map_err(|error| match error {
                StorageError::ShortRead { size, .. } => Error::Format(FormatError::Truncated {
                    structure: "static header",
                    offset: 0,
                    size,
                    expected: STATIC_HEADER_SIZE as u64,
                }),
                error => error.into(),
            })?;
        let found = StaticHeader::decode(&header)?;
        if found != expected {
            return Err(Error::ConfigMismatch { expected, found });
        }

        let recovered = Recovery::new(&*device, found).run()?;
        let shards = recovered
            .shards
            .into_iter()
            .enumerate()
            .map(|(shard, recovered)| {
                Mutex::new(LbaShard::recover(
                    shard,
                    &found,
                    options.compaction_threshold,
                    &recovered.metablock,
                    recovered.sealed,
                ))
            })
            .collect();
        Ok(Self {
            config: found,
            metablocks: Mutex::new(MetablockManager::resume(
                recovered.slot,
                recovered.metablock.block_sequence_id,
            )),
            shards,
            data: Mutex::new(DataBlockManager::recover(
                &found,
                options.active_data_extents,
                &recovered.metablock.data_block_manager_part,
            )),
            extents: Mutex::new(ExtentManager::from_in_use(&found, &recovered.extents_in_use)),
            index: RwLock::new(recovered.index),
            device,
        })
    }

    /// Opens the store described by `config`, creating it first if the
    /// device is empty and [`StoreConfig::create_if_missing`] is set.
    pub fn open_with_config(config: &StoreConfig) -> Result<Self, Error> {
        let device = <dyn BlockDevice>::open(&config.device, config.create_if_missing)?;
        if config.create_if_missing && device.size()? == 0 {
            Self::create(device, config)
        } else {
            Self::open(device, config)
        }
    }

    pub fn static_config(&self) -> StaticConfig {
        self.config
    }

    /// Returns where `block_id` currently lives.
    pub fn lookup(&self, block_id: BlockId) -> Option<BlockInfo> {
        self.index.read().unwrap().get(block_id)
    }

    /// Writes `data` as the new contents of `block_id` and returns the
    /// offset it was written to.
    ///
    /// `data` may be shorter than a block, in which case it is padded with
    /// zeros.  The new contents are visible to [`lookup`](Self::lookup) and
    /// [`read`](Self::read) immediately and durable after the next
    /// [`checkpoint`](Self::checkpoint).
    ///
    /// Concurrent appends to the same block id may be logged in a different
    /// order than their data was placed; callers write each block id from
    /// one thread at a time.
    pub fn append(&self, block_id: BlockId, recency: Recency, data: &[u8]) -> Result<u64, Error> {
        check_block_id(block_id)?;
        let offset = {
            let mut data_blocks = self.data.lock().unwrap();
            let mut extents = self.extents.lock().unwrap();
            data_blocks.append(data, &*self.device, &mut extents)?
        };
        self.log(LbaEntry::live(block_id, recency, offset))?;
        Ok(offset)
    }

    /// Deletes `block_id`.  Returns whether it existed.
    pub fn delete(&self, block_id: BlockId, recency: Recency) -> Result<bool, Error> {
        check_block_id(block_id)?;
        Ok(self.log(LbaEntry::deletion(block_id, recency))?.is_some())
    }

    /// Reads the contents of `block_id`, a full block, or returns `None` if
    /// it does not exist.
    pub fn read(&self, block_id: BlockId) -> Result<Option<Vec<u8>>, Error> {
        let Some(info) = self.lookup(block_id) else {
            return Ok(None);
        };
        let data_blocks = self.data.lock().unwrap();
        Ok(Some(data_blocks.read(info.offset, &*self.device)?))
    }

    /// Appends `entry` to its shard and applies it to the index.  Returns
    /// what the index held for the block before.
    fn log(&self, entry: LbaEntry) -> Result<Option<BlockInfo>, Error> {
        let mut shard = self.shards[shard_of(entry.block_id)].lock().unwrap();
        {
            let mut extents = self.extents.lock().unwrap();
            shard.append(entry, &*self.device, &mut extents)?;
        }
        let mut index = self.index.write().unwrap();
        let previous = index.get(entry.block_id);
        index.apply(&entry);
        Ok(previous)
    }

    /// Makes every append and delete so far durable and returns the new
    /// metablock's sequence id.
    ///
    /// Shards with enough sealed LBA extents are compacted first.  Extents
    /// released along the way become reusable only once the new metablock
    /// is durable.
    pub fn checkpoint(&self) -> Result<u64, Error> {
        let start = Instant::now();
        let mut metablocks = self.metablocks.lock().unwrap();
        let mut shards: Vec<MutexGuard<'_, LbaShard>> = self
            .shards
            .iter()
            .map(|shard| shard.lock().unwrap())
            .collect();
        let data_blocks = self.data.lock().unwrap();
        let mut extents = self.extents.lock().unwrap();

        let mut lba_index_part = LbaMetablockMixin::empty();
        for (i, shard) in shards.iter_mut().enumerate() {
            if shard.needs_compaction() {
                let live = self.index.read().unwrap().shard_entries(i);
                shard.compact(live, &*self.device, &mut extents)?;
            }
            lba_index_part.shards[i] = shard.flush(&*self.device, &mut extents)?;
        }
        let metablock = Metablock {
            extent_manager_part: extents.mixin(),
            lba_index_part,
            data_block_manager_part: data_blocks.mixin(),
            block_sequence_id: 0,
        };

        // Everything the metablock refers to must be durable before it is.
        self.device.sync()?;
        let sequence_id = metablocks.write(&*self.device, metablock)?;
        extents.checkpoint_committed();

        counter!(CHECKPOINTS).increment(1);
        histogram!(CHECKPOINT_LATENCY).record(start.elapsed().as_secs_f64());
        debug!(
            "checkpoint {sequence_id}: {} extents in use",
            extents.extents_in_use()
        );
        Ok(sequence_id)
    }

    /// Checkpoints and closes the store.
    pub fn close(self) -> Result<u64, Error> {
        let sequence_id = self.checkpoint()?;
        info!(
            "closed store on {} at checkpoint {sequence_id}",
            self.device.describe()
        );
        Ok(sequence_id)
    }

    pub fn stats(&self) -> StoreStats {
        let sequence_id = self.metablocks.lock().unwrap().sequence_id();
        let sealed_lba_extents = self
            .shards
            .iter()
            .map(|shard| shard.lock().unwrap().sealed_extents())
            .sum();
        let active_data_extents = self.data.lock().unwrap().active_extents().count();
        let extents_in_use = self.extents.lock().unwrap().extents_in_use();
        let live_blocks = self.index.read().unwrap().len();
        StoreStats {
            live_blocks,
            extents_in_use,
            sequence_id,
            sealed_lba_extents,
            active_data_extents,
        }
    }
}

fn check_block_id(block_id: BlockId) -> Result<(), Error> {
    if block_id == NULL_BLOCK_ID {
        Err(Error::InvalidBlockId(block_id))
    } else {
        Ok(())
    }
}
