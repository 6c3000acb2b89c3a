//! # Archive Wire Format
//!
//! Layout of the sound archive the engine streams from. Every record is a
//! `#[repr(C)]` Pod struct read straight out of transferred bytes. Fields are
//! stored in host byte order (all supported targets are little-endian);
//! sequence bytecode operands are big-endian and handled by the sequencer.
//!
//! ## Layout
//!
//! ```text
//! 0x00  ArchiveHeader ── offsets of the four regions below
//!       sequence directory : DirectoryHeader + DirectoryEntry[count]
//!       bank directory     : DirectoryHeader + DirectoryEntry[count]
//!       sample directory   : DirectoryHeader + DirectoryEntry[count]   (one entry per bank)
//!       bank sets          : u16 offset per sequence, then [count, bank ids...]
//! ```
//!
//! Directory entry offsets are relative to their directory's start.
//!
//! A bank blob is a [`BankHeader`] followed by its body. Inside the body,
//! offsets are body-relative and 0 means "absent":
//!
//! ```text
//! body+0   u32 drum table offset
//! body+4   u32 instrument offsets [instrument count]
//! ...      InstrumentRecord / DrumRecord / SampleRecord / envelope points
//! ```

use bytemuck::{Pod, Zeroable};

use crate::constants::MAX_BANKS_PER_SET;

/// Magic at the start of an archive.
pub const ARCHIVE_MAGIC: [u8; 4] = *b"CDNC";

/// Magic at the start of every directory.
pub const DIRECTORY_MAGIC: [u8; 4] = *b"CDIR";

/// Record flag: embedded offsets already rewritten to heap offsets.
pub const RECORD_RELOCATED: u8 = 0x01;

/// Sample flag: address already rewritten.
pub const SAMPLE_RELOCATED: u32 = 0x01;

/// Sample flag: copy the sample into the heap when its bank loads.
pub const SAMPLE_RESIDENT: u32 = 0x80;

/// Sample flag: the address is a heap offset, not a device address.
pub const SAMPLE_IN_HEAP: u32 = 0x100;

/// Root header at device address 0.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ArchiveHeader {
    /// [`ARCHIVE_MAGIC`].
    pub magic: [u8; 4],
    /// Device address of the sequence directory.
    pub sequences: u32,
    /// Device address of the bank directory.
    pub banks: u32,
    /// Device address of the sample directory.
    pub samples: u32,
    /// Device address of the bank-set table.
    pub bank_sets: u32,
    /// Length of the bank-set table.
    pub bank_sets_len: u32,
    /// Zero.
    pub reserved: [u32; 2],
}

/// Header of a directory.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DirectoryHeader {
    /// [`DIRECTORY_MAGIC`].
    pub magic: [u8; 4],
    /// Number of entries that follow.
    pub count: u32,
    /// Zero.
    pub reserved: [u32; 2],
}

/// One directory entry.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DirectoryEntry {
    /// Offset from the directory start.
    pub offset: u32,
    /// Length in bytes.
    pub len: u32,
}

/// Header of a bank blob.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct BankHeader {
    /// Entries in the instrument offset table.
    pub instruments: u32,
    /// Entries in the drum offset table.
    pub drums: u32,
    /// Zero.
    pub reserved: [u32; 2],
}

/// A sample reference plus its tuning.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct SoundRecord {
    /// Offset of the [`SampleRecord`], 0 for none.
    pub sample: u32,
    /// Playback-rate multiplier.
    pub tuning: f32,
}

/// A pitched instrument with three key ranges.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct InstrumentRecord {
    /// [`RECORD_RELOCATED`] once patched.
    pub flags: u8,
    /// Lowest semitone played with `normal`; anything below uses `low`.
    pub range_lo: u8,
    /// Highest semitone played with `normal`.
    pub range_hi: u8,
    /// Envelope release rate.
    pub release_rate: u8,
    /// Offset of the envelope points.
    pub envelope: u32,
    /// Sound below the normal range.
    pub low: SoundRecord,
    /// Sound inside the normal range.
    pub normal: SoundRecord,
    /// Sound above the normal range.
    pub high: SoundRecord,
}

/// An unpitched drum.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct DrumRecord {
    /// [`RECORD_RELOCATED`] once patched.
    pub flags: u8,
    /// Envelope release rate.
    pub release_rate: u8,
    /// Fixed pan position.
    pub pan: u8,
    /// Zero.
    pub reserved: u8,
    /// Offset of the envelope points.
    pub envelope: u32,
    /// The drum's sound.
    pub sound: SoundRecord,
}

/// Sample metadata. The sample data itself stays in the sample region.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SampleRecord {
    /// `SAMPLE_*` flags.
    pub flags: u32,
    /// Offset into the bank's sample region (device address once relocated).
    pub address: u32,
    /// Sample data length.
    pub size: u32,
    /// Offset of loop info, 0 for none.
    pub loop_ref: u32,
    /// Offset of the codebook, 0 for none.
    pub book: u32,
    /// Zero.
    pub reserved: [u32; 3],
}

/// One envelope point; a delay of 0 ends the envelope.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct EnvelopePoint {
    /// Ticks to reach `arg`, or a negative control code.
    pub delay: i16,
    /// Target level.
    pub arg: i16,
}

/// Reads a `T` at `offset`, or None if it would run past the end.
#[inline]
#[must_use]
pub fn read_record<T: Pod>(bytes: &[u8], offset: usize) -> Option<T> {
    let end = offset.checked_add(std::mem::size_of::<T>())?;
    bytes.get(offset..end).map(bytemuck::pod_read_unaligned::<T>)
}

/// Writes `value` at `offset`.
///
/// Returns `false` if it does not fit.
#[inline]
pub fn write_record<T: Pod>(bytes: &mut [u8], offset: usize, value: &T) -> bool {
    let Some(end) = offset.checked_add(std::mem::size_of::<T>()) else {
        return false;
    };
    match bytes.get_mut(offset..end) {
        Some(target) => {
            target.copy_from_slice(bytemuck::bytes_of(value));
            true
        }
        None => false,
    }
}

/// Reads a `u32` at `offset`.
#[inline]
#[must_use]
pub fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    read_record::<u32>(bytes, offset)
}

/// The banks a sequence needs.
///
/// Banks are stored in set order. Bytecode selects them by index counted
/// from the end, so index 0 is the last bank, which is also the default.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BankSet {
    banks: [u8; MAX_BANKS_PER_SET],
    len: u8,
}

impl BankSet {
    /// Parses the set of `seq_id` out of a bank-set table.
    ///
    /// Sets longer than [`MAX_BANKS_PER_SET`] are truncated.
    #[must_use]
    pub fn parse(table: &[u8], seq_id: u8) -> Option<Self> {
        let at = usize::from(seq_id) * 2;
        let offset = usize::from(u16::from_le_bytes([*table.get(at)?, *table.get(at + 1)?]));
        let count = usize::from(*table.get(offset)?);
        let ids = table.get(offset + 1..offset + 1 + count)?;
        Some(Self::from_banks(ids))
    }

    /// Builds a set from a list of bank ids.
    #[must_use]
    pub fn from_banks(banks: &[u8]) -> Self {
        let mut set = Self::default();
        for &bank in banks.iter().take(MAX_BANKS_PER_SET) {
            set.banks[usize::from(set.len)] = bank;
            set.len += 1;
        }
        set
    }

    /// Banks in set order.
    #[inline]
    #[must_use]
    pub fn banks(&self) -> &[u8] {
        &self.banks[..usize::from(self.len)]
    }

    /// Number of banks.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len as usize
    }

    /// Returns true for a set with no banks.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The bank a player uses when the script does not pick one.
    #[inline]
    #[must_use]
    pub fn default_bank(&self) -> Option<u8> {
        self.banks().last().copied()
    }

    /// Bank selected by bytecode index `index` (0 = default bank).
    #[must_use]
    pub fn select(&self, index: u8) -> Option<u8> {
        let position = self.len().checked_sub(usize::from(index) + 1)?;
        self.banks().get(position).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sizes() {
        assert_eq!(std::mem::size_of::<ArchiveHeader>(), 32);
        assert_eq!(std::mem::size_of::<DirectoryHeader>(), 16);
        assert_eq!(std::mem::size_of::<BankHeader>(), 16);
        assert_eq!(std::mem::size_of::<InstrumentRecord>(), 32);
        assert_eq!(std::mem::size_of::<DrumRecord>(), 16);
        assert_eq!(std::mem::size_of::<SampleRecord>(), 32);
    }

    #[test]
    fn test_read_write_bounds() {
        let mut bytes = [0u8; 12];
        let entry = DirectoryEntry { offset: 5, len: 9 };
        assert!(write_record(&mut bytes, 3, &entry));
        assert_eq!(read_record::<DirectoryEntry>(&bytes, 3), Some(entry));
        assert!(!write_record(&mut bytes, 8, &entry));
        assert_eq!(read_record::<DirectoryEntry>(&bytes, 8), None);
    }

    #[test]
    fn test_bank_set_selection() {
        // Two sequences: seq 0 -> [4], seq 1 -> [2, 7, 9]
        let table = [4, 0, 6, 0, 1, 4, 3, 2, 7, 9];
        let set = BankSet::parse(&table, 1).unwrap();
        assert_eq!(set.banks(), &[2, 7, 9]);
        assert_eq!(set.default_bank(), Some(9));
        assert_eq!(set.select(0), Some(9));
        assert_eq!(set.select(2), Some(2));
        assert_eq!(set.select(3), None);

        assert_eq!(BankSet::parse(&table, 0).unwrap().banks(), &[4]);
        assert!(BankSet::parse(&table, 9).is_none());
    }
}
