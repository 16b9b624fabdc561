//! Storage metrics.
//!
//! The constants defined in this module are the names of metrics that the
//! devices and the store maintain via [`metrics`] crate interfaces.
use ::metrics::{describe_counter, describe_histogram, Unit};

/// Total number of successful device writes.
pub const WRITES_SUCCESS: &str = "disk.total_writes_success";

/// Total number of failed device writes.
pub const WRITES_FAILED: &str = "disk.total_writes_failed";

/// Total number of successful device reads.
pub const READS_SUCCESS: &str = "disk.total_reads_success";

/// Total number of failed device reads.
pub const READS_FAILED: &str = "disk.total_reads_failed";

/// Total number of bytes successfully written.
pub const TOTAL_BYTES_WRITTEN: &str = "disk.total_bytes_written";

/// Total number of bytes successfully read.
pub const TOTAL_BYTES_READ: &str = "disk.total_bytes_read";

/// Total number of syncs to stable storage.
pub const SYNCS: &str = "disk.total_syncs";

/// Histogram of sync latency.
pub const SYNC_LATENCY: &str = "disk.sync_latency";

/// Total number of metablocks written.
pub const CHECKPOINTS: &str = "store.total_checkpoints";

/// Histogram of checkpoint latency.
pub const CHECKPOINT_LATENCY: &str = "store.checkpoint_latency";

/// Total number of LBA extents sealed because they filled up.
pub const LBA_EXTENTS_SEALED: &str = "store.lba_extents_sealed";

/// Total number of LBA shard compactions.
pub const LBA_COMPACTIONS: &str = "store.lba_compactions";

/// Adds descriptions for the metrics we expose.
pub(crate) fn describe_storage_metrics() {
    describe_counter!(WRITES_SUCCESS, "total number of device writes");
    describe_counter!(WRITES_FAILED, "total number of failed device writes");
    describe_counter!(READS_SUCCESS, "total number of device reads");
    describe_counter!(READS_FAILED, "total number of failed device reads");

    describe_counter!(
        TOTAL_BYTES_WRITTEN,
        Unit::Bytes,
        "total number of bytes written to the device"
    );
    describe_counter!(
        TOTAL_BYTES_READ,
        Unit::Bytes,
        "total number of bytes read from the device"
    );

    describe_counter!(SYNCS, "total number of syncs to stable storage");
    describe_histogram!(SYNC_LATENCY, Unit::Seconds, "Sync latency");

    describe_counter!(CHECKPOINTS, "total number of metablocks written");
    describe_histogram!(CHECKPOINT_LATENCY, Unit::Seconds, "Checkpoint latency");
    describe_counter!(LBA_EXTENTS_SEALED, "total number of LBA extents sealed");
    describe_counter!(LBA_COMPACTIONS, "total number of LBA shard compactions");
}
