//! The writable state of one LBA shard.
//!
//! A shard appends entries to its current LBA extent.  When that extent
//! fills, it is sealed: written out and added to the shard's list of sealed
//! extents, and a fresh extent takes its place.  At each checkpoint the
//! shard writes its pending entries and, if the sealed list changed, a new
//! superblock, then reports the [`LbaShardMetablock`] that describes it.
//!
//! Sealed extents are never rewritten.  Once a shard has accumulated enough
//! of them, it is compacted: the live entries for the shard are taken from
//! the in-memory index and written to fresh extents, and all of the old
//! extents are released.

use logstore_storage::metrics::{LBA_COMPACTIONS, LBA_EXTENTS_SEALED};
use logstore_storage::BlockDevice;
use metrics::counter;
use tracing::{debug, info};

use super::{encode_superblock, LbaEntry, LbaExtentWriter, LbaSuperblockEntry};
use crate::error::Error;
use crate::extent_manager::ExtentManager;
use crate::format::{StaticConfig, NULL_OFFSET};
use crate::metablock::LbaShardMetablock;

/// A superblock that has been written.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct SuperblockLocation {
    offset: u64,
    count: u64,
}

#[derive(Debug)]
pub struct LbaShard {
    shard: usize,
    config: StaticConfig,

    /// Extent receiving appends, if any.
    current: Option<LbaExtentWriter>,

    /// Full extents, oldest first.
    sealed: Vec<LbaSuperblockEntry>,

    /// Superblock listing `sealed` as of the last flush.
    superblock: Option<SuperblockLocation>,

    /// Whether `sealed` changed since `superblock` was written.
    superblock_dirty: bool,

    /// Number of sealed extents that triggers compaction.
    compaction_threshold: usize,
}

impl LbaShard {
    /// Returns an empty shard.
    pub fn new(shard: usize, config: &StaticConfig, compaction_threshold: usize) -> Self {
        Self {
            shard,
            config: *config,
            current: None,
            sealed: Vec::new(),
            superblock: None,
            superblock_dirty: false,
            compaction_threshold,
        }
    }

    /// Returns the shard described by `metablock`, whose superblock lists
    /// `sealed`.  Recovery has already validated both.
    pub fn recover(
        shard: usize,
        config: &StaticConfig,
        compaction_threshold: usize,
        metablock: &LbaShardMetablock,
        sealed: Vec<LbaSuperblockEntry>,
    ) -> Self {
        let current = (metablock.last_lba_extent_offset != NULL_OFFSET).then(|| {
            LbaExtentWriter::resume(
                metablock.last_lba_extent_offset,
                metablock.last_lba_extent_entries_count,
                config,
            )
        });
        let superblock = (metablock.lba_superblock_offset != NULL_OFFSET).then_some(
            SuperblockLocation {
                offset: metablock.lba_superblock_offset,
                count: metablock.lba_superblock_entries_count,
            },
        );
        Self {
            shard,
            config: *config,
            current,
            sealed,
            superblock,
            superblock_dirty: false,
            compaction_threshold,
        }
    }

    /// Appends `entry` to the log, sealing the current extent first if it
    /// is full.  The entry reaches the device at the latest at the next
    /// [`flush`](Self::flush).
    pub fn append(
        &mut self,
        entry: LbaEntry,
        device: &dyn BlockDevice,
        extents: &mut ExtentManager,
    ) -> Result<(), Error> {
        let mut entry = entry;
        loop {
            if let Some(current) = self.current.as_mut() {
                match current.push(entry) {
                    Ok(()) => return Ok(()),
                    Err(rejected) => entry = rejected,
                }
            }
            self.seal(device)?;
            self.current = Some(LbaExtentWriter::new(extents.allocate(), &self.config));
        }
    }

    /// Writes out the current extent, if any, and moves it to the sealed
    /// list.  If the write fails, the extent stays current with its pending
    /// entries, so a later seal or flush retries it.
    fn seal(&mut self, device: &dyn BlockDevice) -> Result<(), Error> {
        let Some(current) = self.current.as_mut() else {
            return Ok(());
        };
        current.write(device)?;
        let Some(current) = self.current.take() else {
            return Ok(());
        };
        debug!(
            "LBA shard {}: sealed extent at {} with {} entries",
            self.shard,
            current.offset(),
            current.written()
        );
        counter!(LBA_EXTENTS_SEALED).increment(1);
        self.sealed.push(LbaSuperblockEntry {
            offset: current.offset(),
            lba_entries_count: current.written(),
        });
        self.superblock_dirty = true;
        Ok(())
    }

    /// Returns true if the shard has accumulated enough sealed extents that
    /// it should be compacted.
    pub fn needs_compaction(&self) -> bool {
        self.sealed.len() >= self.compaction_threshold
    }

    /// Replaces the shard's log by `live`, which must hold exactly the live
    /// entries for this shard.  All of the shard's old extents are released
    /// once the next metablock is durable.
    ///
    /// Returns false, without doing anything, if the live entries would not
    /// fit in fewer extents than the sealed ones already occupy.
    pub fn compact(
        &mut self,
        live: Vec<LbaEntry>,
        device: &dyn BlockDevice,
        extents: &mut ExtentManager,
    ) -> Result<bool, Error> {
        let needed = (live.len() as u64).div_ceil(self.config.lba_entries_per_extent());
        if needed >= self.sealed.len() as u64 {
            debug!(
                "LBA shard {}: {} live entries need {needed} extents, not compacting",
                self.shard,
                live.len()
            );
            return Ok(false);
        }
        info!(
            "LBA shard {}: compacting {} sealed extents into {} live entries",
            self.shard,
            self.sealed.len(),
            live.len()
        );

        // The new log is built beside the old one, which stays in place
        // until every write has succeeded.
        let mut compacted = LbaShard::new(self.shard, &self.config, self.compaction_threshold);
        for entry in live {
            if let Err(error) = compacted.append(entry, device, extents) {
                for offset in compacted.extents() {
                    extents.release_after_checkpoint(offset);
                }
                return Err(error);
            }
        }

        for offset in self.extents() {
            extents.release_after_checkpoint(offset);
        }
        self.current = compacted.current;
        self.sealed = compacted.sealed;
        self.superblock = None;
        self.superblock_dirty = true;
        counter!(LBA_COMPACTIONS).increment(1);
        Ok(true)
    }

    /// Writes pending entries and, if needed, a new superblock, and returns
    /// the metablock part that describes the shard once the device is
    /// synced.
    pub fn flush(
        &mut self,
        device: &dyn BlockDevice,
        extents: &mut ExtentManager,
    ) -> Result<LbaShardMetablock, Error> {
        if let Some(current) = self.current.as_mut() {
            current.pad_to_device_block();
            current.write(device)?;
        }

        if self.superblock_dirty {
            let capacity = self.config.lba_entries_per_extent();
            if self.sealed.len() as u64 > capacity {
                return Err(Error::CapacityExceeded {
                    what: "LBA superblock",
                    requested: self.sealed.len() as u64,
                    capacity,
                });
            }
            let new = if self.sealed.is_empty() {
                None
            } else {
                let offset = extents.allocate();
                if let Err(error) = device.write_all_at(offset, &encode_superblock(&self.sealed)) {
                    extents.release_after_checkpoint(offset);
                    return Err(error.into());
                }
                Some(SuperblockLocation {
                    offset,
                    count: self.sealed.len() as u64,
                })
            };
            if let Some(old) = std::mem::replace(&mut self.superblock, new) {
                extents.release_after_checkpoint(old.offset);
            }
            self.superblock_dirty = false;
        }
        Ok(self.metablock())
    }

    /// Returns the metablock part for what is on the device now.
    pub fn metablock(&self) -> LbaShardMetablock {
        let (last_lba_extent_offset, last_lba_extent_entries_count) = self
            .current
            .as_ref()
            .map_or((NULL_OFFSET, 0), |current| (current.offset(), current.written()));
        let (lba_superblock_offset, lba_superblock_entries_count) = self
            .superblock
            .map_or((NULL_OFFSET, 0), |superblock| (superblock.offset, superblock.count));
        LbaShardMetablock {
            last_lba_extent_offset,
            last_lba_extent_entries_count,
            lba_superblock_offset,
            lba_superblock_entries_count,
        }
    }

    /// Returns the offsets of every extent the shard owns.
    pub fn extents(&self) -> Vec<u64> {
        self.sealed
            .iter()
            .map(|entry| entry.offset)
            .chain(self.current.as_ref().map(|current| current.offset()))
            .chain(self.superblock.map(|superblock| superblock.offset))
            .collect()
    }

    /// Number of sealed extents.
    pub fn sealed_extents(&self) -> usize {
        self.sealed.len()
    }
}

#[cfg(test)]
mod tests {
    use logstore_storage::memory::MemoryDevice;

    use super::LbaShard;
    use crate::extent_manager::ExtentManager;
    use crate::format::{Recency, StaticConfig, NULL_OFFSET};
    use crate::lba::{
        decode_superblock, read_lba_extent, read_lba_superblock, LbaEntry, LbaExtentReader,
        LbaIndex,
    };

    const CONFIG: StaticConfig = StaticConfig::new(512, 12288);
    const E: u64 = 12288;

    fn replay(device: &MemoryDevice, shard: &LbaShard) -> LbaIndex {
        let metablock = shard.metablock();
        let mut index = LbaIndex::new();
        let mut extents = Vec::new();
        if metablock.lba_superblock_offset != NULL_OFFSET {
            let bytes = read_lba_superblock(
                device,
                &CONFIG,
                metablock.lba_superblock_offset,
                metablock.lba_superblock_entries_count,
            )
            .unwrap();
            for entry in decode_superblock(
                &bytes,
                metablock.lba_superblock_offset,
                metablock.lba_superblock_entries_count,
                &CONFIG,
            )
            .unwrap()
            {
                extents.push((entry.offset, entry.lba_entries_count));
            }
        }
        if metablock.last_lba_extent_offset != NULL_OFFSET {
            extents.push((
                metablock.last_lba_extent_offset,
                metablock.last_lba_extent_entries_count,
            ));
        }
        for (offset, count) in extents {
            let bytes = read_lba_extent(device, &CONFIG, offset, count).unwrap();
            let reader = LbaExtentReader::new(&bytes, offset).unwrap();
            for entry in reader.scan(count).unwrap() {
                index.apply(&entry.unwrap());
            }
        }
        index
    }

    #[test]
    fn empty_shard() {
        let device = MemoryDevice::new();
        let mut extents = ExtentManager::new(&CONFIG);
        let mut shard = LbaShard::new(0, &CONFIG, 4);
        let metablock = shard.flush(&device, &mut extents).unwrap();
        assert_eq!(metablock.last_lba_extent_offset, NULL_OFFSET);
        assert_eq!(metablock.lba_superblock_offset, NULL_OFFSET);
        assert_eq!(extents.extents_in_use(), 1);
    }

    #[test]
    fn seal_and_flush() {
        let device = MemoryDevice::new();
        let mut extents = ExtentManager::new(&CONFIG);
        let mut shard = LbaShard::new(0, &CONFIG, 100);
        let capacity = CONFIG.lba_entries_per_extent();

        let mut expected = LbaIndex::new();
        for i in 0..capacity * 2 + 10 {
            let entry = LbaEntry::live((i % 50) as u32 * 16, Recency(i as u32), i * 512);
            expected.apply(&entry);
            shard.append(entry, &device, &mut extents).unwrap();
        }
        assert_eq!(shard.sealed_extents(), 2);

        let metablock = shard.flush(&device, &mut extents).unwrap();
        assert_eq!(metablock.lba_superblock_entries_count, 2);
        assert_eq!(metablock.last_lba_extent_entries_count % 32, 31);
        assert_eq!(replay(&device, &shard), expected);

        // A flush with nothing new writes nothing and allocates nothing.
        let in_use = extents.extents_in_use();
        assert_eq!(shard.flush(&device, &mut extents).unwrap(), metablock);
        assert_eq!(extents.extents_in_use(), in_use);
    }

    #[test]
    fn superblock_is_copy_on_write() {
        let device = MemoryDevice::new();
        let mut extents = ExtentManager::new(&CONFIG);
        let mut shard = LbaShard::new(0, &CONFIG, 100);
        let capacity = CONFIG.lba_entries_per_extent();

        for i in 0..capacity + 1 {
            shard
                .append(LbaEntry::live(16, Recency(0), i * 512), &device, &mut extents)
                .unwrap();
        }
        let first = shard.flush(&device, &mut extents).unwrap();
        extents.checkpoint_committed();

        for i in 0..capacity {
            shard
                .append(LbaEntry::live(32, Recency(0), i * 512), &device, &mut extents)
                .unwrap();
        }
        let second = shard.flush(&device, &mut extents).unwrap();
        assert_ne!(first.lba_superblock_offset, second.lba_superblock_offset);
        assert_eq!(second.lba_superblock_entries_count, 2);

        // The old superblock is still intact until the checkpoint commits.
        let bytes = read_lba_superblock(&device, &CONFIG, first.lba_superblock_offset, 1).unwrap();
        assert_eq!(
            decode_superblock(&bytes, first.lba_superblock_offset, 1, &CONFIG)
                .unwrap()
                .len(),
            1
        );
        assert_eq!(extents.allocate(), 6 * E);
    }

    #[test]
    fn compaction_preserves_index() {
        let device = MemoryDevice::new();
        let mut extents = ExtentManager::new(&CONFIG);
        let mut shard = LbaShard::new(0, &CONFIG, 2);
        let capacity = CONFIG.lba_entries_per_extent();

        let mut index = LbaIndex::new();
        for i in 0..capacity * 3 {
            let entry = if i % 7 == 0 {
                LbaEntry::deletion((i % 20) as u32 * 16, Recency(i as u32))
            } else {
                LbaEntry::live((i % 20) as u32 * 16, Recency(i as u32), i * 512)
            };
            index.apply(&entry);
            shard.append(entry, &device, &mut extents).unwrap();
        }
        shard.flush(&device, &mut extents).unwrap();
        extents.checkpoint_committed();
        assert!(shard.needs_compaction());
        let before = extents.extents_in_use();

        assert!(shard
            .compact(index.shard_entries(0), &device, &mut extents)
            .unwrap());
        let metablock = shard.flush(&device, &mut extents).unwrap();
        assert_eq!(metablock.lba_superblock_offset, NULL_OFFSET);
        assert!(!shard.needs_compaction());
        assert_eq!(replay(&device, &shard), index);

        extents.checkpoint_committed();
        assert!(extents.extents_in_use() < before);
    }

    #[test]
    fn compaction_skipped_when_nothing_to_gain() {
        let device = MemoryDevice::new();
        let mut extents = ExtentManager::new(&CONFIG);
        let mut shard = LbaShard::new(0, &CONFIG, 1);
        let capacity = CONFIG.lba_entries_per_extent();

        // Every entry is for a distinct block, so nothing is garbage.
        let mut index = LbaIndex::new();
        for i in 0..capacity + 1 {
            let entry = LbaEntry::live(i as u32 * 16, Recency(0), i * 512);
            index.apply(&entry);
            shard.append(entry, &device, &mut extents).unwrap();
        }
        let before = shard.flush(&device, &mut extents).unwrap();
        assert!(shard.needs_compaction());
        assert!(!shard
            .compact(index.shard_entries(0), &device, &mut extents)
            .unwrap());
        assert_eq!(shard.flush(&device, &mut extents).unwrap(), before);
    }

    #[test]
    fn failed_seal_keeps_extent() {
        let device = MemoryDevice::new();
        let mut extents = ExtentManager::new(&CONFIG);
        let mut shard = LbaShard::new(0, &CONFIG, 100);
        let capacity = CONFIG.lba_entries_per_extent();

        let mut index = LbaIndex::new();
        let entry = |i: u64| LbaEntry::live(i as u32 * 16, Recency(0), i * 512);
        for i in 0..10 {
            index.apply(&entry(i));
            shard.append(entry(i), &device, &mut extents).unwrap();
        }
        let committed = shard.flush(&device, &mut extents).unwrap();
        extents.checkpoint_committed();

        // Fill the extent without writing it.
        let end = 10 + capacity - committed.last_lba_extent_entries_count;
        for i in 10..end {
            index.apply(&entry(i));
            shard.append(entry(i), &device, &mut extents).unwrap();
        }
        let i = end;

        device.fail_write_after(0);
        assert!(shard.append(entry(i), &device, &mut extents).is_err());
        assert_eq!(shard.metablock(), committed);
        assert_eq!(shard.sealed_extents(), 0);

        index.apply(&entry(i));
        shard.append(entry(i), &device, &mut extents).unwrap();
        assert_eq!(shard.sealed_extents(), 1);
        shard.flush(&device, &mut extents).unwrap();
        assert_eq!(replay(&device, &shard), index);
    }

    #[test]
    fn failed_compaction_keeps_log() {
        let device = MemoryDevice::new();
        let mut extents = ExtentManager::new(&CONFIG);
        let mut shard = LbaShard::new(0, &CONFIG, 2);
        let capacity = CONFIG.lba_entries_per_extent();

        // Enough live entries that the compacted log needs a sealed extent.
        let mut index = LbaIndex::new();
        for i in 0..capacity * 3 + 1 {
            let entry = LbaEntry::live((i % 800) as u32 * 16, Recency(i as u32), i * 512);
            index.apply(&entry);
            shard.append(entry, &device, &mut extents).unwrap();
        }
        let committed = shard.flush(&device, &mut extents).unwrap();
        extents.checkpoint_committed();
        assert_eq!(shard.sealed_extents(), 3);
        let in_use = extents.extents_in_use();

        device.fail_write_after(0);
        assert!(shard
            .compact(index.shard_entries(0), &device, &mut extents)
            .is_err());
        assert_eq!(shard.metablock(), committed);
        assert_eq!(shard.sealed_extents(), 3);
        assert_eq!(replay(&device, &shard), index);

        // Nothing the failed attempt allocated stays in use.
        extents.checkpoint_committed();
        assert_eq!(extents.extents_in_use(), in_use);

        assert!(shard
            .compact(index.shard_entries(0), &device, &mut extents)
            .unwrap());
        shard.flush(&device, &mut extents).unwrap();
        assert_eq!(shard.sealed_extents(), 1);
        assert_eq!(replay(&device, &shard), index);
    }
}
