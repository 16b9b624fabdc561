use binrw::{
    io::{Read, Seek, Write},
    BinRead, BinResult, BinWrite, Endian, Error as BinError,
};
use std::fmt::{Debug, Formatter, Result as FmtResult};

use super::FixedLen;

/// A physical byte offset, or one of two sentinel states, in exactly 8 bytes.
///
/// Real offsets occupy `0..=i64::MAX`, so the top bit is always clear.  The
/// sentinels are reserved bit patterns with the top bit set:
///
/// * [`FlaggedOffset::padding`] (all ones) marks a filler or tombstone.
/// * [`FlaggedOffset::unused`] (all ones but the lowest bit) marks a value
///   that was never set.
///
/// Any other pattern with the top bit set is rejected when read from disk.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct FlaggedOffset(u64);

impl FlaggedOffset {
    const PADDING: u64 = u64::MAX;
    const UNUSED: u64 = u64::MAX - 1;

    /// The largest offset that can be represented.
    pub const MAX_VALUE: u64 = i64::MAX as u64;

    /// Returns the "no value" sentinel.
    pub const fn unused() -> Self {
        Self(Self::UNUSED)
    }

    /// Returns the padding/tombstone sentinel.
    pub const fn padding() -> Self {
        Self(Self::PADDING)
    }

    /// Returns a flagged offset holding the real offset `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset` exceeds [`FlaggedOffset::MAX_VALUE`].
    pub fn from_value(offset: u64) -> Self {
        let mut this = Self::unused();
        this.set_value(offset);
        this
    }

    /// Stores the real offset `offset`, clearing any sentinel.
    ///
    /// # Panics
    ///
    /// Panics if `offset` exceeds [`FlaggedOffset::MAX_VALUE`].
    pub fn set_value(&mut self, offset: u64) {
        assert!(
            offset <= Self::MAX_VALUE,
            "offset {offset:#x} does not fit in a flagged offset"
        );
        self.0 = offset;
    }

    /// Returns true if this holds a real offset (including 0).
    pub const fn has_value(&self) -> bool {
        self.0 <= Self::MAX_VALUE
    }

    /// Returns true if this is the padding sentinel.
    pub const fn is_padding(&self) -> bool {
        self.0 == Self::PADDING
    }

    /// Returns true if this is the unused sentinel.
    pub const fn is_unused(&self) -> bool {
        self.0 == Self::UNUSED
    }

    /// Returns the real offset, if there is one.
    pub const fn value(&self) -> Option<u64> {
        if self.has_value() {
            Some(self.0)
        } else {
            None
        }
    }

    /// Returns the encoded 64-bit pattern.
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Interprets a raw 64-bit pattern read from storage.  Returns `None` for
    /// patterns that are neither a real offset nor a sentinel.
    pub const fn from_raw(raw: u64) -> Option<Self> {
        if raw <= Self::MAX_VALUE || raw == Self::PADDING || raw == Self::UNUSED {
            Some(Self(raw))
        } else {
            None
        }
    }
}

impl Debug for FlaggedOffset {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self.value() {
            Some(offset) => write!(f, "FlaggedOffset({offset})"),
            None if self.is_padding() => write!(f, "FlaggedOffset(padding)"),
            None => write!(f, "FlaggedOffset(unused)"),
        }
    }
}

impl FixedLen for FlaggedOffset {
    const LEN: usize = 8;
}

impl BinRead for FlaggedOffset {
    type Args<'a> = ();

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        endian: Endian,
        _args: Self::Args<'_>,
    ) -> BinResult<Self> {
        let pos = reader.stream_position()?;
        let raw = u64::read_options(reader, endian, ())?;
        Self::from_raw(raw).ok_or_else(|| BinError::AssertFail {
            pos,
            message: format!("invalid flagged offset {raw:#x}"),
        })
    }
}

impl BinWrite for FlaggedOffset {
    type Args<'a> = ();

    fn write_options<W: Write + Seek>(
        &self,
        writer: &mut W,
        endian: Endian,
        _args: Self::Args<'_>,
    ) -> BinResult<()> {
        self.0.write_options(writer, endian, ())
    }
}

#[cfg(test)]
mod tests {
    use super::FlaggedOffset;
    use crate::format::{decode, encode, FixedLen};
    use std::mem::size_of;

    const OFFSETS: [u64; 7] = [0, 1, 4095, 4096, 4097, 234234 * 4096, 12345678901234567];

    #[test]
    fn set_value_clears_sentinels() {
        for off in OFFSETS {
            let mut real = FlaggedOffset::unused();
            real.set_value(off);
            let mut deleteblock = FlaggedOffset::padding();
            deleteblock.set_value(off);
            assert!(real.has_value());
            assert!(deleteblock.has_value());
            assert!(!real.is_padding());
            assert!(!deleteblock.is_padding());
            assert_eq!(real.value(), Some(off));

            real.set_value(73);
            deleteblock.set_value(95);

            assert!(real.has_value());
            assert!(deleteblock.has_value());
            assert!(!real.is_padding());
            assert!(!deleteblock.is_padding());
        }
    }

    #[test]
    fn sentinels() {
        assert!(!FlaggedOffset::unused().has_value());
        assert!(!FlaggedOffset::padding().has_value());
        assert!(FlaggedOffset::padding().is_padding());
        assert!(!FlaggedOffset::unused().is_padding());
        assert!(FlaggedOffset::unused().is_unused());
        assert_ne!(FlaggedOffset::unused(), FlaggedOffset::padding());
        assert_eq!(FlaggedOffset::unused().value(), None);
    }

    #[test]
    fn exactly_eight_bytes() {
        assert_eq!(size_of::<FlaggedOffset>(), 8);
        assert_eq!(FlaggedOffset::LEN, 8);
        assert_eq!(encode(&FlaggedOffset::from_value(5)), 5u64.to_le_bytes());
        assert_eq!(encode(&FlaggedOffset::padding()), [0xff; 8]);
    }

    #[test]
    fn rejects_unknown_patterns() {
        assert!(FlaggedOffset::from_raw(1 << 63).is_none());
        assert!(decode::<FlaggedOffset>(&(u64::MAX - 2).to_le_bytes()).is_err());
        assert_eq!(
            decode::<FlaggedOffset>(&(u64::MAX - 1).to_le_bytes()).unwrap(),
            FlaggedOffset::unused()
        );
        assert_eq!(
            decode::<FlaggedOffset>(&FlaggedOffset::MAX_VALUE.to_le_bytes()).unwrap(),
            FlaggedOffset::from_value(FlaggedOffset::MAX_VALUE)
        );
    }

    #[test]
    #[should_panic]
    fn set_value_out_of_range() {
        FlaggedOffset::unused().set_value(1 << 63);
    }
}
