use binrw::binrw;
use crc32c::crc32c;

use super::{decode, encode, FixedLen, VERSION_NUMBER};
use crate::error::FormatError;

/// Header of a checksummed block (the static header and metablock slots).
///
/// The checksum is CRC32C over the rest of the block, everything from byte 4
/// to the end, including zero padding.
#[binrw]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub checksum: u32,
    pub version: u32,
    pub magic: [u8; 8],
}

impl FixedLen for BlockHeader {
    const LEN: usize = 16;
}

/// Returns a `size`-byte block containing a header with `magic`, then
/// `body`, then zero padding, with the checksum filled in.
pub(crate) fn seal_block(magic: [u8; 8], body: &[u8], size: usize) -> Vec<u8> {
    let mut block = encode(&BlockHeader {
        checksum: 0,
        version: VERSION_NUMBER,
        magic,
    });
    assert!(BlockHeader::LEN + body.len() <= size);
    block.extend_from_slice(body);
    block.resize(size, 0);
    let checksum = crc32c(&block[4..]);
    block[..4].copy_from_slice(&checksum.to_le_bytes());
    block
}

/// Validates the header of `block`, read from `offset`, and returns the
/// bytes that follow the header.
pub(crate) fn open_block<'a>(
    structure: &'static str,
    magic: [u8; 8],
    block: &'a [u8],
    offset: u64,
) -> Result<&'a [u8], FormatError> {
    if block.len() < BlockHeader::LEN {
        return Err(FormatError::Truncated {
            structure,
            offset,
            size: block.len() as u64,
            expected: BlockHeader::LEN as u64,
        });
    }
    let header: BlockHeader = decode(block)?;
    if header.magic != magic {
        return Err(FormatError::BadMagic {
            structure,
            offset,
            expected: magic,
            found: header.magic,
        });
    }
    let computed_checksum = crc32c(&block[4..]);
    if header.checksum != computed_checksum {
        return Err(FormatError::InvalidChecksum {
            structure,
            offset,
            checksum: header.checksum,
            computed_checksum,
        });
    }
    if header.version != VERSION_NUMBER {
        return Err(FormatError::InvalidVersion {
            structure,
            offset,
            version: header.version,
            expected_version: VERSION_NUMBER,
        });
    }
    Ok(&block[BlockHeader::LEN..])
}
