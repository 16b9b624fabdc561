use logstore_storage::{block::BlockLocation, error::StorageError, BlockDevice};
use tracing::debug;

use super::{Metablock, MetablockSlot};
use crate::format::METABLOCK_SLOT_SIZE;

/// Writes metablocks, alternating between the two slots.
#[derive(Debug)]
pub struct MetablockManager {
    /// Slot holding the most recent durable metablock.
    last_slot: MetablockSlot,

    /// Its sequence id.
    sequence_id: u64,
}

impl MetablockManager {
    /// Returns a manager for a new store.  The first metablock goes to slot
    /// A with sequence id 1.
    pub fn new() -> Self {
        Self {
            last_slot: MetablockSlot::B,
            sequence_id: 0,
        }
    }

    /// Returns a manager that continues after the durable metablock in
    /// `slot` with `sequence_id`.
    pub fn resume(slot: MetablockSlot, sequence_id: u64) -> Self {
        Self {
            last_slot: slot,
            sequence_id,
        }
    }

    /// Sequence id of the most recent durable metablock, or 0 if none has
    /// been written.
    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    pub fn last_slot(&self) -> MetablockSlot {
        self.last_slot
    }

    /// Stamps `metablock` with the next sequence id, writes it to the slot
    /// not holding the latest metablock, and syncs.  Returns the new
    /// sequence id.
    ///
    /// Everything the metablock refers to must already be durable.  If this
    /// fails, the previous metablock remains the latest.
    pub fn write(
        &mut self,
        device: &dyn BlockDevice,
        mut metablock: Metablock,
    ) -> Result<u64, StorageError> {
        let slot = self.last_slot.other();
        let sequence_id = self.sequence_id + 1;
        metablock.block_sequence_id = sequence_id;
        device.write_all_at(slot.offset(), &metablock.encode_slot())?;
        device.sync()?;
        debug!("wrote metablock {sequence_id} to slot {slot:?}");
        self.last_slot = slot;
        self.sequence_id = sequence_id;
        Ok(sequence_id)
    }
}

impl Default for MetablockManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads the raw contents of both slots.
pub fn read_slots(device: &dyn BlockDevice) -> Result<[Vec<u8>; 2], StorageError> {
    let read = |slot: MetablockSlot| {
        device.read_exact_at(BlockLocation::new(slot.offset(), METABLOCK_SLOT_SIZE))
    };
    Ok([read(MetablockSlot::A)?, read(MetablockSlot::B)?])
}
