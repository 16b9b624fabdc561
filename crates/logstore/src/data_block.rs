//! Data block placement.
//!
//! Data blocks are appended to a small set of active data extents, chosen
//! round-robin.  An extent leaves the active set when it fills and a freshly
//! allocated extent takes its place.  Blocks are written in place and never
//! moved, so a block's offset stays valid for as long as an LBA entry refers
//! to it.

use logstore_storage::{block::BlockLocation, BlockDevice};
use tracing::debug;

use crate::error::Error;
use crate::extent_manager::ExtentManager;
use crate::format::{StaticConfig, MAX_ACTIVE_DATA_EXTENTS, NULL_OFFSET};
use crate::metablock::DataBlockManagerMixin;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct ActiveExtent {
    offset: u64,

    /// Number of blocks written so far, counting from the start of the
    /// extent.
    blocks: u64,
}

#[derive(Debug)]
pub struct DataBlockManager {
    config: StaticConfig,

    /// Maximum number of active extents.
    n_active: usize,

    active: Vec<ActiveExtent>,

    /// Round-robin position.
    next: usize,
}

impl DataBlockManager {
    pub fn new(config: &StaticConfig, n_active: usize) -> Self {
        debug_assert!((1..=MAX_ACTIVE_DATA_EXTENTS).contains(&n_active));
        Self {
            config: *config,
            n_active,
            active: Vec::with_capacity(n_active),
            next: 0,
        }
    }

    /// Restores the active extents recorded in `mixin`.  Recovery has
    /// already validated it.
    ///
    /// If `n_active` is less than the number recorded, the excess extents
    /// stay active until they fill.
    pub fn recover(config: &StaticConfig, n_active: usize, mixin: &DataBlockManagerMixin) -> Self {
        let mut manager = Self::new(config, n_active);
        manager.active = mixin
            .active()
            .map(|(offset, blocks)| ActiveExtent { offset, blocks })
            .filter(|extent| extent.blocks < config.blocks_per_extent())
            .collect();
        manager
    }

    /// Writes `data`, zero-padded to a full block, to the next free block
    /// and returns the block's offset.  Does not sync.
    pub fn append(
        &mut self,
        data: &[u8],
        device: &dyn BlockDevice,
        extents: &mut ExtentManager,
    ) -> Result<u64, Error> {
        let block_size = self.config.block_size;
        if data.len() as u64 > block_size {
            return Err(Error::CapacityExceeded {
                what: "Data block",
                requested: data.len() as u64,
                capacity: block_size,
            });
        }

        let limit = self.n_active.max(self.active.len());
        let index = self.next % limit;
        self.next = (index + 1) % limit;
        let index = if index < self.active.len() {
            index
        } else {
            let offset = extents.allocate();
            debug!("new active data extent at {offset}");
            self.active.push(ActiveExtent { offset, blocks: 0 });
            self.active.len() - 1
        };

        let extent = &mut self.active[index];
        let offset = extent.offset + extent.blocks * block_size;
        let mut block = Vec::with_capacity(block_size as usize);
        block.extend_from_slice(data);
        block.resize(block_size as usize, 0);
        device.write_all_at(offset, &block)?;
        extent.blocks += 1;

        if extent.blocks == self.config.blocks_per_extent() {
            debug!("data extent at {} is full", extent.offset);
            self.active.remove(index);
        }
        Ok(offset)
    }

    /// Reads the block at `offset`.
    pub fn read(&self, offset: u64, device: &dyn BlockDevice) -> Result<Vec<u8>, Error> {
        Ok(device.read_exact_at(BlockLocation::new(offset, self.config.block_size as usize))?)
    }

    /// Returns the offsets of the active extents.
    pub fn active_extents(&self) -> impl Iterator<Item = u64> + '_ {
        self.active.iter().map(|extent| extent.offset)
    }

    pub fn mixin(&self) -> DataBlockManagerMixin {
        let mut mixin = DataBlockManagerMixin::empty();
        for (i, extent) in self.active.iter().enumerate() {
            mixin.active_extents[i] = extent.offset;
            mixin.blocks_in_active_extent[i] = extent.blocks;
        }
        debug_assert!(mixin.active_extents[self.active.len()..]
            .iter()
            .all(|offset| *offset == NULL_OFFSET));
        mixin
    }
}

#[cfg(test)]
mod tests {
    use logstore_storage::memory::MemoryDevice;

    use super::DataBlockManager;
    use crate::error::Error;
    use crate::extent_manager::ExtentManager;
    use crate::format::StaticConfig;

    const CONFIG: StaticConfig = StaticConfig::new(512, 12288);
    const E: u64 = 12288;

    #[test]
    fn fills_extents_in_order() {
        let device = MemoryDevice::new();
        let mut extents = ExtentManager::new(&CONFIG);
        let mut manager = DataBlockManager::new(&CONFIG, 1);

        for i in 0..CONFIG.blocks_per_extent() {
            assert_eq!(manager.append(&[i as u8], &device, &mut extents).unwrap(), E + i * 512);
        }
        assert_eq!(manager.active_extents().count(), 0);
        assert_eq!(manager.append(b"next", &device, &mut extents).unwrap(), 2 * E);

        let block = manager.read(E + 3 * 512, &device).unwrap();
        assert_eq!(block.len(), 512);
        assert_eq!(block[0], 3);
        assert!(block[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn round_robin() {
        let device = MemoryDevice::new();
        let mut extents = ExtentManager::new(&CONFIG);
        let mut manager = DataBlockManager::new(&CONFIG, 3);

        let offsets: Vec<_> = (0..6)
            .map(|_| manager.append(b"x", &device, &mut extents).unwrap())
            .collect();
        assert_eq!(offsets, vec![E, 2 * E, 3 * E, E + 512, 2 * E + 512, 3 * E + 512]);

        let mixin = manager.mixin();
        assert_eq!(mixin.active().collect::<Vec<_>>(), vec![(E, 2), (2 * E, 2), (3 * E, 2)]);

        let recovered = DataBlockManager::recover(&CONFIG, 3, &mixin);
        assert_eq!(recovered.mixin(), mixin);
    }

    #[test]
    fn oversized_block() {
        let device = MemoryDevice::new();
        let mut extents = ExtentManager::new(&CONFIG);
        let mut manager = DataBlockManager::new(&CONFIG, 1);
        assert!(matches!(
            manager.append(&[0; 513], &device, &mut extents),
            Err(Error::CapacityExceeded {
                requested: 513,
                capacity: 512,
                ..
            })
        ));
        assert_eq!(extents.extents_in_use(), 1);
    }
}
