use std::collections::HashMap;

use super::LbaEntry;
use crate::format::{shard_of, BlockId, Recency};

/// Where a block currently lives.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Device offset of the block's data.
    pub offset: u64,

    /// Recency recorded with the block's latest entry.
    pub recency: Recency,
}

/// The in-memory LBA index: the result of folding every LBA entry, in log
/// order, into a map from block id to location.
///
/// Later entries override earlier ones; a deletion removes the block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LbaIndex {
    blocks: HashMap<BlockId, BlockInfo>,
}

impl LbaIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds `entry` into the index.
    pub fn apply(&mut self, entry: &LbaEntry) {
        if entry.is_padding() {
            return;
        }
        match entry.offset.value() {
            Some(offset) => {
                self.blocks.insert(
                    entry.block_id,
                    BlockInfo {
                        offset,
                        recency: entry.recency,
                    },
                );
            }
            None => {
                self.blocks.remove(&entry.block_id);
            }
        }
    }

    pub fn get(&self, block_id: BlockId) -> Option<BlockInfo> {
        self.blocks.get(&block_id).copied()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (BlockId, BlockInfo)> + '_ {
        self.blocks.iter().map(|(id, info)| (*id, *info))
    }

    /// Returns one live entry for each block in `shard`, ordered by block
    /// id.  Replaying them reproduces this shard's part of the index.
    pub fn shard_entries(&self, shard: usize) -> Vec<LbaEntry> {
        let mut entries: Vec<_> = self
            .blocks
            .iter()
            .filter(|(id, _)| shard_of(**id) == shard)
            .map(|(id, info)| LbaEntry::live(*id, info.recency, info.offset))
            .collect();
        entries.sort_unstable_by_key(|entry| entry.block_id);
        entries
    }
}
