//! # Archive Index
//!
//! The root header and the four directories, copied once into the init
//! pool at startup. Every later lookup reads the heap copy; only content
//! bytes are fetched from the device.

use cadence_core::{ArenaPool, Block, ContentKind, Heap};
use cadence_shared::archive::{
    read_record, ArchiveHeader, BankSet, DirectoryEntry, DirectoryHeader, ARCHIVE_MAGIC,
    DIRECTORY_MAGIC,
};
use cadence_shared::constants::{MAX_BANKS, MAX_SEQUENCES};

use crate::error::{EngineError, EngineResult};
use crate::transfer::{DeviceAddr, TransferDevice};

const HEADER_LEN: usize = std::mem::size_of::<ArchiveHeader>();
const DIRECTORY_HEADER_LEN: usize = std::mem::size_of::<DirectoryHeader>();
const ENTRY_LEN: usize = std::mem::size_of::<DirectoryEntry>();

/// A directory copied into the heap, plus where it lives on the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Directory {
    base: DeviceAddr,
    block: Block,
    count: usize,
}

impl Directory {
    fn load(
        heap: &mut Heap,
        pool: &mut ArenaPool,
        device: &mut dyn TransferDevice,
        base: DeviceAddr,
        limit: usize,
    ) -> EngineResult<Self> {
        let mut raw = [0u8; DIRECTORY_HEADER_LEN];
        device.copy_blocking(base, &mut raw)?;
        let header = read_record::<DirectoryHeader>(&raw, 0)
            .ok_or(EngineError::InvalidArchive("truncated directory header"))?;
        if header.magic != DIRECTORY_MAGIC {
            return Err(EngineError::InvalidArchive("bad directory magic"));
        }

        let count = header.count as usize;
        if count > limit {
            return Err(EngineError::InvalidArchive("directory has too many entries"));
        }

        let len = DIRECTORY_HEADER_LEN + count * ENTRY_LEN;
        let block = pool.alloc(heap, len).ok_or(EngineError::OutOfMemory(
            cadence_core::MemoryError::OutOfMemory {
                requested: len,
                remaining: pool.remaining(),
            },
        ))?;
        let block = Block::new(block.offset(), len);
        device.copy_blocking(base, heap.slice_mut(block))?;

        Ok(Self { base, block, count })
    }

    /// Number of entries.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.count
    }

    /// Returns true for an empty directory.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Device address and length of entry `index`.
    #[must_use]
    pub fn entry(&self, heap: &Heap, index: usize) -> Option<(DeviceAddr, usize)> {
        if index >= self.count {
            return None;
        }
        let entry = read_record::<DirectoryEntry>(
            heap.slice(self.block),
            DIRECTORY_HEADER_LEN + index * ENTRY_LEN,
        )?;
        let address = self.base.checked_add(entry.offset)?;
        Some((address, entry.len as usize))
    }
}

/// Everything the loader needs to find content on the device.
#[derive(Clone, Debug)]
pub struct ArchiveIndex {
    sequences: Directory,
    banks: Directory,
    samples: Directory,
    bank_sets: Block,
}

impl ArchiveIndex {
    /// Reads the archive header and directories from `device` into `pool`.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidArchive`] for a malformed archive, an
    /// out-of-memory error if `pool` is too small, or a transfer error.
    pub fn load(
        heap: &mut Heap,
        pool: &mut ArenaPool,
        device: &mut dyn TransferDevice,
    ) -> EngineResult<Self> {
        let mut raw = [0u8; HEADER_LEN];
        device.copy_blocking(0, &mut raw)?;
        let header = read_record::<ArchiveHeader>(&raw, 0)
            .ok_or(EngineError::InvalidArchive("truncated archive header"))?;
        if header.magic != ARCHIVE_MAGIC {
            return Err(EngineError::InvalidArchive("bad archive magic"));
        }

        let sequences = Directory::load(heap, pool, device, header.sequences, MAX_SEQUENCES)?;
        let banks = Directory::load(heap, pool, device, header.banks, MAX_BANKS)?;
        let samples = Directory::load(heap, pool, device, header.samples, MAX_BANKS)?;

        let sets_len = header.bank_sets_len as usize;
        let bank_sets = match pool.alloc(heap, sets_len) {
            Some(block) => Block::new(block.offset(), sets_len),
            None => {
                return Err(EngineError::OutOfMemory(
                    cadence_core::MemoryError::OutOfMemory {
                        requested: sets_len,
                        remaining: pool.remaining(),
                    },
                ))
            }
        };
        device.copy_blocking(header.bank_sets, heap.slice_mut(bank_sets))?;

        tracing::info!(
            sequences = sequences.len(),
            banks = banks.len(),
            used = pool.used(),
            "archive index loaded"
        );

        Ok(Self {
            sequences,
            banks,
            samples,
            bank_sets,
        })
    }

    /// Number of sequences in the archive.
    #[inline]
    #[must_use]
    pub const fn sequence_count(&self) -> usize {
        self.sequences.len()
    }

    /// Number of banks in the archive.
    #[inline]
    #[must_use]
    pub const fn bank_count(&self) -> usize {
        self.banks.len()
    }

    /// Device address and length of content `id` of `kind`.
    #[must_use]
    pub fn entry(&self, heap: &Heap, kind: ContentKind, id: u8) -> Option<(DeviceAddr, usize)> {
        let directory = match kind {
            ContentKind::Sequence => &self.sequences,
            ContentKind::Bank => &self.banks,
        };
        directory.entry(heap, usize::from(id))
    }

    /// Device address of the sample region belonging to `bank`.
    #[must_use]
    pub fn sample_base(&self, heap: &Heap, bank: u8) -> Option<DeviceAddr> {
        self.samples
            .entry(heap, usize::from(bank))
            .map(|(address, _)| address)
    }

    /// Banks used by sequence `seq`.
    #[must_use]
    pub fn bank_set(&self, heap: &Heap, seq: u8) -> Option<BankSet> {
        if usize::from(seq) >= self.sequences.len() {
            return None;
        }
        BankSet::parse(heap.slice(self.bank_sets), seq)
    }
}
