//! A log-structured block store.
//!
//! The store keeps fixed-size data blocks, addressed by 32-bit logical
//! block ids, on a single device.  Blocks are never overwritten in place:
//! each write goes to a fresh location and is recorded in a sharded,
//! append-only LBA (logical block address) log.  A metablock, written
//! alternately to one of two checksummed slots, is the root from which the
//! whole state can be rebuilt after a crash.
//!
//! * [`format`] defines the on-disk encoding of every structure.
//! * [`lba`] holds the LBA log and the in-memory index it replays into.
//! * [`metablock`] defines the metablock and writes it.
//! * [`recovery`] rebuilds in-memory state from the device.
//! * [`Store`] is the API for reading, writing, and checkpointing blocks.
//!
//! ```no_run
//! use logstore::{Recency, Store};
//! use logstore_types::config::StoreConfig;
//!
//! let config = StoreConfig {
//!     create_if_missing: true,
//!     ..StoreConfig::with_path("/tmp/blocks.db")
//! };
//! let store = Store::open_with_config(&config)?;
//! store.append(7, Recency(1), b"hello")?;
//! store.checkpoint()?;
//! assert!(store.read(7)?.unwrap().starts_with(b"hello"));
//! # Ok::<(), logstore::Error>(())
//! ```

pub mod data_block;
pub mod error;
pub mod extent_manager;
pub mod format;
pub mod lba;
pub mod metablock;
pub mod recovery;
pub mod store;

#[cfg(test)]
mod test;

pub use error::{CorruptStore, Error, FormatError};
pub use format::{BlockId, FlaggedOffset, Recency, StaticConfig};
pub use lba::BlockInfo;
pub use store::{Store, StoreStats};
