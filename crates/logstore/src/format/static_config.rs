use binrw::binrw;
use logstore_types::config::StoreConfig;
use std::fmt::{Display, Formatter, Result as FmtResult};

use super::{
    decode, encode, open_block, seal_block, FixedLen, FlaggedOffset, DEVICE_BLOCK_SIZE, RESERVED_SIZE,
    STATIC_HEADER_MAGIC, STATIC_HEADER_SIZE,
};
use crate::error::FormatError;
use crate::lba::{LbaEntry, LbaExtentHeader};

/// Store parameters fixed at creation time.
#[binrw]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StaticConfig {
    /// Size of a data block in bytes.
    pub block_size: u64,

    /// Size of an extent in bytes.
    pub extent_size: u64,
}

impl FixedLen for StaticConfig {
    const LEN: usize = 16;
}

impl StaticConfig {
    pub const fn new(block_size: u64, extent_size: u64) -> Self {
        Self {
            block_size,
            extent_size,
        }
    }

    /// Checks that the sizes describe a usable store.
    pub fn validate(&self) -> Result<(), FormatError> {
        let reason = if self.block_size == 0 || self.block_size % DEVICE_BLOCK_SIZE != 0 {
            "block size must be a non-zero multiple of 512"
        } else if self.extent_size % self.block_size != 0 {
            "extent size must be a multiple of the block size"
        } else if self.extent_size < RESERVED_SIZE {
            "extent size must be at least 12288"
        } else {
            return Ok(());
        };
        Err(FormatError::InvalidStaticConfig {
            block_size: self.block_size,
            extent_size: self.extent_size,
            reason,
        })
    }

    /// Number of data blocks that fit in one extent.
    pub const fn blocks_per_extent(&self) -> u64 {
        self.extent_size / self.block_size
    }

    /// Number of LBA entries that fit in one LBA extent after its header.
    /// A superblock holds the same number of entries.
    pub const fn lba_entries_per_extent(&self) -> u64 {
        (self.extent_size - LbaExtentHeader::LEN as u64) / LbaEntry::LEN as u64
    }

    /// Returns the offset of the extent that contains `offset`.
    pub const fn extent_of(&self, offset: u64) -> u64 {
        offset - offset % self.extent_size
    }

    /// Returns true if `offset` is the start of an extent other than the
    /// reserved extent 0, and every byte of that extent has an offset that
    /// a [`FlaggedOffset`] can hold.
    pub const fn is_extent_start(&self, offset: u64) -> bool {
        offset != 0
            && offset % self.extent_size == 0
            && offset <= FlaggedOffset::MAX_VALUE
            && FlaggedOffset::MAX_VALUE - offset >= self.extent_size - 1
    }
}

impl From<&StoreConfig> for StaticConfig {
    fn from(config: &StoreConfig) -> Self {
        Self::new(config.block_size, config.extent_size)
    }
}

impl Display for StaticConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(
            f,
            "block size {} and extent size {}",
            self.block_size, self.extent_size
        )
    }
}

/// The block at offset 0 that identifies a store and records its
/// [`StaticConfig`].
///
/// | Offset | Size | Field                       |
/// |-------:|-----:|-----------------------------|
/// | 0      | 4    | checksum                    |
/// | 4      | 4    | version                     |
/// | 8      | 8    | magic `logstore`            |
/// | 16     | 16   | [`StaticConfig`]            |
/// | 32     |      | zero padding to 4096 bytes  |
pub struct StaticHeader;

impl StaticHeader {
    const STRUCTURE: &'static str = "static header";

    pub fn encode(config: &StaticConfig) -> Vec<u8> {
        seal_block(STATIC_HEADER_MAGIC, &encode(config), STATIC_HEADER_SIZE)
    }

    /// Decodes and validates a static header.
    pub fn decode(block: &[u8]) -> Result<StaticConfig, FormatError> {
        let body = open_block(Self::STRUCTURE, STATIC_HEADER_MAGIC, block, 0)?;
        let config: StaticConfig = decode(body)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::{StaticConfig, StaticHeader};
    use crate::error::FormatError;
    use crate::format::{encode, FixedLen, FlaggedOffset, STATIC_HEADER_SIZE};

    #[test]
    fn layout() {
        let config = StaticConfig::new(4096, 1 << 20);
        let bytes = encode(&config);
        assert_eq!(bytes.len(), StaticConfig::LEN);
        assert_eq!(&bytes[0..8], &4096u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &(1u64 << 20).to_le_bytes());

        let header = StaticHeader::encode(&config);
        assert_eq!(header.len(), STATIC_HEADER_SIZE);
        assert_eq!(&header[8..16], b"logstore");
        assert_eq!(&header[16..32], &bytes[..]);
        assert_eq!(StaticHeader::decode(&header).unwrap(), config);
    }

    #[test]
    fn validation() {
        assert!(StaticConfig::new(512, 12288).validate().is_ok());
        assert!(StaticConfig::new(4096, 1 << 20).validate().is_ok());
        for (block_size, extent_size) in [(0, 12288), (1000, 12000), (4096, 6144), (4096, 8192)] {
            assert!(
                matches!(
                    StaticConfig::new(block_size, extent_size).validate(),
                    Err(FormatError::InvalidStaticConfig { .. })
                ),
                "{block_size} {extent_size}"
            );
        }
    }

    #[test]
    fn capacities() {
        let config = StaticConfig::new(4096, 1 << 20);
        assert_eq!(config.blocks_per_extent(), 256);
        assert_eq!(config.lba_entries_per_extent(), ((1 << 20) - 16) / 16);
        assert_eq!(config.extent_of(3 * (1 << 20) + 4096), 3 << 20);
        assert!(config.is_extent_start(1 << 20));
        assert!(!config.is_extent_start(0));
        assert!(!config.is_extent_start(4096));

        let last = (FlaggedOffset::MAX_VALUE + 1) / config.extent_size * config.extent_size
            - config.extent_size;
        assert!(config.is_extent_start(last));
        assert!(!config.is_extent_start(last + config.extent_size));
        assert!(!config.is_extent_start(u64::MAX / config.extent_size * config.extent_size));
    }
}
