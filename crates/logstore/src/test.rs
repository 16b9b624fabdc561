//! Helpers shared by the tests in this crate.

use std::sync::Arc;

use logstore_storage::{memory::MemoryDevice, BlockDevice};
use logstore_types::config::StoreConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::format::StaticConfig;

pub(crate) fn init_test_logger() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .expect("valid default filter");

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .with(env_filter)
        .try_init();
    logstore_storage::init();
}

/// Smallest sizes the format allows, so that tests fill extents quickly.
pub(crate) const SMALL: StaticConfig = StaticConfig::new(512, 12288);

/// Returns a memory-device configuration with [`SMALL`] sizes.
pub(crate) fn small_config() -> StoreConfig {
    StoreConfig {
        block_size: SMALL.block_size,
        extent_size: SMALL.extent_size,
        ..StoreConfig::default()
    }
}

/// Returns `device` as the trait object that [`crate::Store`] takes.
pub(crate) fn shared(device: &MemoryDevice) -> Arc<dyn BlockDevice> {
    Arc::new(device.clone())
}
