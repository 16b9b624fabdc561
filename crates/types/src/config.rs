//! Store configuration.
//!
//! This module defines the configuration structure used to open or create a
//! store.  The whole tree can be deserialized from a JSON file.  Fields that
//! become part of the on-disk format ([`StoreConfig::block_size`] and
//! [`StoreConfig::extent_size`]) are recorded in the store's static header
//! when it is created and must match on every later open.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default value of [`StoreConfig::block_size`].
pub const fn default_block_size() -> u64 {
    4096
}

/// Default value of [`StoreConfig::extent_size`].
pub const fn default_extent_size() -> u64 {
    1024 * 1024
}

/// Default value of [`StoreConfig::active_data_extents`].
pub const fn default_active_data_extents() -> usize {
    1
}

/// Default value of [`StoreConfig::lba_compaction_threshold`].
pub const fn default_lba_compaction_threshold() -> usize {
    32
}

/// An error loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Unable to read configuration file {path:?}: {error}")]
    Io {
        path: PathBuf,
        error: std::io::Error,
    },

    /// The file is not valid JSON for a [`StoreConfig`].
    #[error("Unable to parse configuration file {path:?}: {error}")]
    Parse {
        path: PathBuf,
        error: serde_json::Error,
    },
}

/// Configuration for opening or creating a store.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Where the store lives.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Size in bytes of one data block.
    ///
    /// Must be a non-zero multiple of 512.  Written into the store when it is
    /// created; opening an existing store with a different value fails.
    #[serde(default = "default_block_size")]
    pub block_size: u64,

    /// Size in bytes of one extent, the unit of allocation for both data
    /// blocks and LBA index entries.
    ///
    /// Must be a multiple of `block_size` and at least 12 KiB, since the
    /// first extent holds the static header and both metablock slots.
    /// Written into the store when it is created.
    #[serde(default = "default_extent_size")]
    pub extent_size: u64,

    /// Number of data extents that accept appends at the same time, between
    /// 1 and 64.  Appends are spread across them round-robin.
    #[serde(default = "default_active_data_extents")]
    pub active_data_extents: usize,

    /// Number of sealed LBA extents a shard may accumulate before its log is
    /// rewritten from the in-memory index at the next checkpoint.
    #[serde(default = "default_lba_compaction_threshold")]
    pub lba_compaction_threshold: usize,

    /// Whether opening a store that does not exist yet creates it.
    #[serde(default)]
    pub create_if_missing: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            block_size: default_block_size(),
            extent_size: default_extent_size(),
            active_data_extents: default_active_data_extents(),
            lba_compaction_threshold: default_lba_compaction_threshold(),
            create_if_missing: false,
        }
    }
}

impl StoreConfig {
    /// Returns a configuration for a file-backed store at `path` with
    /// default sizing.
    pub fn with_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            device: DeviceConfig::File {
                path: path.as_ref().to_string_lossy().into_owned(),
            },
            ..Self::default()
        }
    }

    /// Reads a configuration from the JSON file at `path`.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|error| ConfigError::Io {
            path: path.to_path_buf(),
            error,
        })?;
        serde_json::from_str(&text).map_err(|error| ConfigError::Parse {
            path: path.to_path_buf(),
            error,
        })
    }
}

/// The device that backs a store.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "config", rename_all = "snake_case")]
pub enum DeviceConfig {
    /// Keep the store in memory.  Useful for tests and for benchmarking the
    /// format without a disk.
    #[default]
    Memory,

    /// Keep the store in a single file on the local file system.
    File {
        /// Path of the store file.
        path: String,
    },
}

impl DeviceConfig {
    /// Returns the file path for [`DeviceConfig::File`].
    pub fn path(&self) -> Option<&Path> {
        match self {
            DeviceConfig::Memory => None,
            DeviceConfig::File { path } => Some(Path::new(path)),
        }
    }
}

impl Display for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceConfig::Memory => write!(f, "memory"),
            DeviceConfig::File { path } => write!(f, "file:{path}"),
        }
    }
}
