//! Extent allocation.
//!
//! Extents are handed out lowest-first from a free set, falling back to
//! growing the device.  An extent that a durable metablock may still
//! reference cannot be reused until the next metablock is durable, so
//! releases are deferred: [`ExtentManager::release_after_checkpoint`] only
//! queues the extent and [`ExtentManager::checkpoint_committed`] frees the
//! queue.

use std::collections::BTreeSet;

use tracing::trace;

use crate::format::StaticConfig;
use crate::metablock::ExtentManagerMixin;

#[derive(Debug)]
pub struct ExtentManager {
    extent_size: u64,

    /// Offset of the first extent that has never been allocated.
    end: u64,

    /// Extents below `end` available for reuse.
    free: BTreeSet<u64>,

    /// Extents released since the last durable metablock.
    pending_release: Vec<u64>,

    /// Number of extents allocated, including extent 0 and extents pending
    /// release.
    in_use: u64,
}

impl ExtentManager {
    /// Returns a manager for a new store, in which only extent 0 is in use.
    pub fn new(config: &StaticConfig) -> Self {
        Self {
            extent_size: config.extent_size,
            end: config.extent_size,
            free: BTreeSet::new(),
            pending_release: Vec::new(),
            in_use: 1,
        }
    }

    /// Returns a manager in which exactly the extents in `in_use` (plus
    /// extent 0) are allocated.
    pub fn from_in_use(config: &StaticConfig, in_use: &BTreeSet<u64>) -> Self {
        let extent_size = config.extent_size;
        let end = in_use
            .last()
            .map_or(extent_size, |last| last + extent_size);
        let free: BTreeSet<u64> = (1..end / extent_size)
            .map(|i| i * extent_size)
            .filter(|offset| !in_use.contains(offset))
            .collect();
        let in_use = in_use.iter().filter(|offset| **offset != 0).count() as u64 + 1;
        Self {
            extent_size,
            end,
            free,
            pending_release: Vec::new(),
            in_use,
        }
    }

    /// Allocates an extent and returns its offset.
    pub fn allocate(&mut self) -> u64 {
        let offset = match self.free.pop_first() {
            Some(offset) => offset,
            None => {
                let offset = self.end;
                self.end += self.extent_size;
                offset
            }
        };
        self.in_use += 1;
        trace!("allocated extent at {offset}");
        offset
    }

    /// Releases the extent at `offset` once the next metablock is durable.
    pub fn release_after_checkpoint(&mut self, offset: u64) {
        debug_assert!(offset != 0 && offset % self.extent_size == 0);
        debug_assert!(offset < self.end);
        self.pending_release.push(offset);
    }

    /// Frees every extent released before the metablock that was just
    /// written.
    pub fn checkpoint_committed(&mut self) {
        for offset in self.pending_release.drain(..) {
            trace!("freed extent at {offset}");
            self.free.insert(offset);
            self.in_use -= 1;
        }
    }

    /// Number of extents in use as of the next metablock, which no longer
    /// references extents pending release.
    pub fn extents_in_use(&self) -> u64 {
        self.in_use - self.pending_release.len() as u64
    }

    /// Offset just past the highest extent ever allocated.
    pub fn high_water_mark(&self) -> u64 {
        self.end
    }

    pub fn mixin(&self) -> ExtentManagerMixin {
        ExtentManagerMixin {
            debug_extents_in_use: self.extents_in_use(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::ExtentManager;
    use crate::format::StaticConfig;

    const CONFIG: StaticConfig = StaticConfig::new(512, 12288);
    const E: u64 = 12288;

    #[test]
    fn grows_then_reuses() {
        let mut manager = ExtentManager::new(&CONFIG);
        assert_eq!(manager.allocate(), E);
        assert_eq!(manager.allocate(), 2 * E);
        assert_eq!(manager.allocate(), 3 * E);
        assert_eq!(manager.extents_in_use(), 4);

        manager.release_after_checkpoint(2 * E);
        assert_eq!(manager.extents_in_use(), 3);

        // Not reusable until the checkpoint commits.
        assert_eq!(manager.allocate(), 4 * E);
        manager.checkpoint_committed();
        assert_eq!(manager.allocate(), 2 * E);
        assert_eq!(manager.allocate(), 5 * E);
        assert_eq!(manager.mixin().debug_extents_in_use, 6);
        assert_eq!(manager.high_water_mark(), 6 * E);
    }

    #[test]
    fn rebuild() {
        let in_use: BTreeSet<u64> = [0, E, 4 * E].into_iter().collect();
        let mut manager = ExtentManager::from_in_use(&CONFIG, &in_use);
        assert_eq!(manager.extents_in_use(), 3);
        assert_eq!(manager.high_water_mark(), 5 * E);
        assert_eq!(manager.allocate(), 2 * E);
        assert_eq!(manager.allocate(), 3 * E);
        assert_eq!(manager.allocate(), 5 * E);

        let manager = ExtentManager::from_in_use(&CONFIG, &BTreeSet::new());
        assert_eq!(manager.extents_in_use(), 1);
        assert_eq!(manager.high_water_mark(), E);
    }
}
