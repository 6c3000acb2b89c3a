//! # Persistent Pool
//!
//! Append-only, id-tagged allocations for content that should stay resident
//! for the whole session. Entries are never freed one by one; the pool is
//! cleared as a whole on session reset.

use super::arena::ArenaPool;
use super::heap::{Block, Heap};
use crate::error::{MemoryError, MemoryResult};

/// Maximum number of entries a persistent pool tracks.
pub const MAX_PERSISTENT_ENTRIES: usize = 32;

/// One tracked persistent allocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PersistentEntry {
    /// Where the content lives.
    pub block: Block,
    /// Content id.
    pub id: u8,
}

/// An arena plus a fixed table of the ids it holds.
#[derive(Clone, Debug)]
pub struct PersistentPool {
    pool: ArenaPool,
    entries: [PersistentEntry; MAX_PERSISTENT_ENTRIES],
    len: usize,
}

impl PersistentPool {
    /// Creates an empty persistent pool over `pool`.
    #[must_use]
    pub fn new(pool: ArenaPool) -> Self {
        Self {
            pool,
            entries: [PersistentEntry::default(); MAX_PERSISTENT_ENTRIES],
            len: 0,
        }
    }

    /// Underlying arena.
    #[inline]
    #[must_use]
    pub const fn arena(&self) -> &ArenaPool {
        &self.pool
    }

    /// Number of tracked entries.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true when nothing is tracked.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Tracked entries in allocation order.
    #[inline]
    #[must_use]
    pub fn entries(&self) -> &[PersistentEntry] {
        &self.entries[..self.len]
    }

    /// Allocates `size` bytes for content `id` and tracks it.
    ///
    /// # Errors
    ///
    /// [`MemoryError::EntryTableFull`] when the table is full, or
    /// [`MemoryError::OutOfMemory`] when the arena cannot hold the request.
    /// Either way nothing is tracked and the caller decides on a fallback.
    pub fn alloc(&mut self, heap: &mut Heap, size: usize, id: u8) -> MemoryResult<Block> {
        if self.len >= MAX_PERSISTENT_ENTRIES {
            return Err(MemoryError::EntryTableFull {
                capacity: MAX_PERSISTENT_ENTRIES,
            });
        }

        let block = self
            .pool
            .alloc(heap, size)
            .ok_or(MemoryError::OutOfMemory {
                requested: size,
                remaining: self.pool.remaining(),
            })?;

        self.entries[self.len] = PersistentEntry { block, id };
        self.len += 1;
        Ok(block)
    }

    /// Finds the block holding content `id`.
    ///
    /// The newest entry wins: a load that failed after allocating leaves
    /// its entry behind, and the retry's entry must not be shadowed by it.
    #[must_use]
    pub fn find(&self, id: u8) -> Option<Block> {
        self.entries()
            .iter()
            .rev()
            .find(|entry| entry.id == id)
            .map(|entry| entry.block)
    }

    /// Drops every entry and rewinds the arena.
    pub fn clear(&mut self) {
        self.len = 0;
        self.pool.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(heap: &Heap) -> PersistentPool {
        PersistentPool::new(ArenaPool::new(heap.whole()))
    }

    #[test]
    fn test_persistent_alloc_and_find() {
        let mut heap = Heap::new(256).unwrap();
        let mut persistent = pool(&heap);

        let a = persistent.alloc(&mut heap, 40, 7).unwrap();
        let b = persistent.alloc(&mut heap, 16, 9).unwrap();

        assert_eq!(persistent.find(7), Some(a));
        assert_eq!(persistent.find(9), Some(b));
        assert_eq!(persistent.find(1), None);
        assert_eq!(persistent.len(), 2);
    }

    #[test]
    fn test_persistent_overflow_tracks_nothing() {
        let mut heap = Heap::new(64).unwrap();
        let mut persistent = pool(&heap);

        let err = persistent.alloc(&mut heap, 128, 1).unwrap_err();
        assert!(matches!(err, MemoryError::OutOfMemory { .. }));
        assert!(persistent.is_empty());
    }

    #[test]
    fn test_persistent_entry_cap() {
        let mut heap = Heap::new(16 * 64).unwrap();
        let mut persistent = pool(&heap);
        for id in 0..MAX_PERSISTENT_ENTRIES {
            persistent.alloc(&mut heap, 16, id as u8).unwrap();
        }
        let err = persistent.alloc(&mut heap, 16, 99).unwrap_err();
        assert_eq!(
            err,
            MemoryError::EntryTableFull {
                capacity: MAX_PERSISTENT_ENTRIES
            }
        );
    }

    #[test]
    fn test_retried_load_is_found_over_abandoned_entry() {
        let mut heap = Heap::new(256).unwrap();
        let mut persistent = pool(&heap);
        let abandoned = persistent.alloc(&mut heap, 32, 5).unwrap();
        let retry = persistent.alloc(&mut heap, 32, 5).unwrap();

        assert_ne!(abandoned, retry);
        assert_eq!(persistent.find(5), Some(retry));
    }

    #[test]
    fn test_persistent_clear() {
        let mut heap = Heap::new(256).unwrap();
        let mut persistent = pool(&heap);
        let first = persistent.alloc(&mut heap, 32, 3).unwrap();
        persistent.clear();
        assert!(persistent.find(3).is_none());
        assert_eq!(persistent.alloc(&mut heap, 32, 4).unwrap(), first);
    }
}
