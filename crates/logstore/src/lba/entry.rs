use binrw::binrw;

use crate::format::{BlockId, FixedLen, FlaggedOffset, Recency, NULL_BLOCK_ID};

/// One record in the LBA log.
///
/// | Offset | Size | Field      |
/// |-------:|-----:|------------|
/// | 0      | 4    | `block_id` |
/// | 4      | 4    | `recency`  |
/// | 8      | 8    | `offset`   |
///
/// Three kinds of entries share this layout:
///
/// * A live entry has a real block id and an offset with a value.
/// * A deletion has a real block id and an offset without a value.
/// * A padding entry has [`NULL_BLOCK_ID`] and an offset without a value.
///   It carries no information and replay skips it.
#[binrw]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LbaEntry {
    pub block_id: BlockId,
    pub recency: Recency,
    pub offset: FlaggedOffset,
}

impl FixedLen for LbaEntry {
    const LEN: usize = 16;
}

impl LbaEntry {
    pub const fn make(block_id: BlockId, recency: Recency, offset: FlaggedOffset) -> Self {
        Self {
            block_id,
            recency,
            offset,
        }
    }

    /// Returns an entry that says `block_id` lives at `offset`.
    pub fn live(block_id: BlockId, recency: Recency, offset: u64) -> Self {
        Self::make(block_id, recency, FlaggedOffset::from_value(offset))
    }

    /// Returns an entry that says `block_id` no longer exists.
    pub const fn deletion(block_id: BlockId, recency: Recency) -> Self {
        Self::make(block_id, recency, FlaggedOffset::padding())
    }

    pub const fn make_padding_entry() -> Self {
        Self::make(NULL_BLOCK_ID, Recency::INVALID, FlaggedOffset::padding())
    }

    pub const fn is_padding(&self) -> bool {
        self.block_id == NULL_BLOCK_ID && !self.offset.has_value()
    }

    pub const fn is_deletion(&self) -> bool {
        self.block_id != NULL_BLOCK_ID && !self.offset.has_value()
    }
}
