use logstore_storage::{memory::MemoryDevice, BlockDevice};
use pretty_assertions::assert_eq;

use super::{
    read_slots, select, slot_status, DataBlockManagerMixin, ExtentManagerMixin,
    LbaMetablockMixin, LbaShardMetablock, Metablock, MetablockManager, MetablockSlot,
};
use crate::error::{CorruptStore, FormatError, SlotStatus};
use crate::format::{encode, FixedLen, METABLOCK_SLOT_SIZE, NULL_OFFSET, RESERVED_SIZE};

fn sample_metablock() -> Metablock {
    let mut metablock = Metablock::empty();
    metablock.extent_manager_part.debug_extents_in_use = 0x0102;
    metablock.lba_index_part.shards[0] = LbaShardMetablock {
        last_lba_extent_offset: 0x1111,
        last_lba_extent_entries_count: 0x2222,
        lba_superblock_offset: 0x3333,
        lba_superblock_entries_count: 0x4444,
    };
    metablock.lba_index_part.shards[15].last_lba_extent_offset = 0x5555;
    metablock.data_block_manager_part.active_extents[0] = 0x6666;
    metablock.data_block_manager_part.blocks_in_active_extent[0] = 0x7777;
    metablock.data_block_manager_part.active_extents[63] = 0x8888;
    metablock.data_block_manager_part.blocks_in_active_extent[63] = 0x9999;
    metablock.block_sequence_id = 0xabcd;
    metablock
}

fn u64_at(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
}

#[test]
fn sizes() {
    assert_eq!(LbaShardMetablock::LEN, 32);
    assert_eq!(LbaMetablockMixin::LEN, 512);
    assert_eq!(DataBlockManagerMixin::LEN, 1024);
    assert_eq!(ExtentManagerMixin::LEN, 8);
    assert_eq!(Metablock::LEN, 8 + 16 * 32 + 2 * 8 * 64 + 8);
    assert_eq!(encode(&sample_metablock()).len(), 1552);
}

#[test]
fn field_offsets() {
    let bytes = encode(&sample_metablock());
    assert_eq!(u64_at(&bytes, 0), 0x0102);

    // LBA part: shard 0 at 8, shard 15 at 8 + 15 * 32.
    assert_eq!(u64_at(&bytes, 8), 0x1111);
    assert_eq!(u64_at(&bytes, 16), 0x2222);
    assert_eq!(u64_at(&bytes, 24), 0x3333);
    assert_eq!(u64_at(&bytes, 32), 0x4444);
    assert_eq!(u64_at(&bytes, 8 + 15 * 32), 0x5555);
    assert_eq!(u64_at(&bytes, 8 + 14 * 32), NULL_OFFSET);

    // Data block manager part: active extents, then block counts.
    assert_eq!(u64_at(&bytes, 520), 0x6666);
    assert_eq!(u64_at(&bytes, 520 + 63 * 8), 0x8888);
    assert_eq!(u64_at(&bytes, 520 + 512), 0x7777);
    assert_eq!(u64_at(&bytes, 520 + 512 + 63 * 8), 0x9999);

    assert_eq!(u64_at(&bytes, 1544), 0xabcd);
}

#[test]
fn slot_round_trip() {
    let metablock = sample_metablock();
    let slot = metablock.encode_slot();
    assert_eq!(slot.len(), METABLOCK_SLOT_SIZE);
    assert_eq!(&slot[8..16], b"metablck");
    assert_eq!(&slot[16..16 + Metablock::LEN], &encode(&metablock)[..]);
    assert_eq!(Metablock::decode_slot(&slot, 4096).unwrap(), metablock);
}

#[test]
fn active_extents() {
    let mixin = sample_metablock().data_block_manager_part;
    assert_eq!(
        mixin.active().collect::<Vec<_>>(),
        vec![(0x6666, 0x7777), (0x8888, 0x9999)]
    );
}

fn slot_with_sequence(sequence_id: u64) -> Vec<u8> {
    let mut metablock = Metablock::empty();
    metablock.block_sequence_id = sequence_id;
    metablock.encode_slot()
}

#[test]
fn select_highest_sequence() {
    let a = slot_with_sequence(7);
    let b = slot_with_sequence(8);
    let selected = select(&a, &b).unwrap();
    assert_eq!(selected.slot, MetablockSlot::B);
    assert_eq!(selected.metablock.block_sequence_id, 8);

    let selected = select(&slot_with_sequence(9), &b).unwrap();
    assert_eq!(selected.slot, MetablockSlot::A);
    assert_eq!(selected.metablock.block_sequence_id, 9);
}

#[test]
fn select_survives_torn_slot() {
    let a = slot_with_sequence(7);
    let mut b = slot_with_sequence(8);
    // A torn write leaves the tail of the slot stale.
    b[2048..].fill(0xaa);
    let selected = select(&a, &b).unwrap();
    assert_eq!(selected.slot, MetablockSlot::A);
    assert_eq!(selected.metablock.block_sequence_id, 7);
    assert!(matches!(
        slot_status(&b, MetablockSlot::B),
        SlotStatus::Invalid(FormatError::InvalidChecksum { .. })
    ));

    // Never-written slot.
    let selected = select(&[0; METABLOCK_SLOT_SIZE], &b[..]);
    assert!(matches!(
        selected,
        Err(CorruptStore::NoValidMetablock {
            slot_a: SlotStatus::Invalid(FormatError::BadMagic { .. }),
            slot_b: SlotStatus::Invalid(FormatError::InvalidChecksum { .. }),
        })
    ));
}

#[test]
fn manager_alternates_slots() {
    let device = MemoryDevice::new();
    device.write_all_at(0, &vec![0; RESERVED_SIZE as usize]).unwrap();
    let mut manager = MetablockManager::new();

    for expected in 1..=5u64 {
        assert_eq!(manager.write(&device, Metablock::empty()).unwrap(), expected);
        let [a, b] = read_slots(&device).unwrap();
        let selected = select(&a, &b).unwrap();
        assert_eq!(selected.metablock.block_sequence_id, expected);
        let slot = if expected % 2 == 1 {
            MetablockSlot::A
        } else {
            MetablockSlot::B
        };
        assert_eq!(selected.slot, slot);
        assert_eq!(manager.last_slot(), slot);
    }
}

#[test]
fn failed_write_keeps_previous_metablock() {
    let device = MemoryDevice::new();
    device.write_all_at(0, &vec![0; RESERVED_SIZE as usize]).unwrap();
    let mut manager = MetablockManager::new();
    manager.write(&device, Metablock::empty()).unwrap();

    device.crash_after_writes(0);
    assert!(manager.write(&device, Metablock::empty()).is_err());
    assert_eq!(manager.sequence_id(), 1);
    device.crash();

    let [a, b] = read_slots(&device).unwrap();
    assert_eq!(select(&a, &b).unwrap().metablock.block_sequence_id, 1);
}

#[test]
fn resume_continues_sequence() {
    let device = MemoryDevice::new();
    device.write_all_at(0, &vec![0; RESERVED_SIZE as usize]).unwrap();
    let mut manager = MetablockManager::resume(MetablockSlot::A, 41);
    assert_eq!(manager.write(&device, Metablock::empty()).unwrap(), 42);
    assert_eq!(manager.last_slot(), MetablockSlot::B);
}
