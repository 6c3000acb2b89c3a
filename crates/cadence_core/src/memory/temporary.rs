//! # Two-Sided Temporary Pool
//!
//! A cache of exactly two content slots sharing one arena: the front slot is
//! placed at the low end, the back slot at the high end.
//!
//! ## Design
//!
//! ```text
//!  start                                                    end
//!    │ front ──────────▶ │        free         │ ◀────── back │
//!    └───────────────────┴─────────────────────┴──────────────┘
//! ```
//!
//! The side that receives a new request is chosen from the load status of
//! the current occupants:
//!
//! 1. an empty / not-loaded side (front first)
//! 2. a discardable side (both discardable: alternate using `next_side`)
//! 3. a side that is not streaming (front first)
//! 4. otherwise fail, both sides are mid-transfer
//!
//! If the new content is too large to leave the other side intact, the other
//! side is evicted even when it is still streaming. This is the pool's
//! pressure release; the caller must discard whatever depended on it.

use super::arena::ArenaPool;
use super::heap::{align16, Block, BLOCK_ALIGN};
use crate::error::{MemoryError, MemoryResult};
use crate::status::{LoadStatus, LoadStatusTable};

/// One of the two slots of a temporary pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    /// Low-address slot.
    Front,
    /// High-address slot.
    Back,
}

impl Side {
    /// The opposite side.
    #[inline]
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::Front => Self::Back,
            Self::Back => Self::Front,
        }
    }

    #[inline]
    const fn index(self) -> usize {
        match self {
            Self::Front => 0,
            Self::Back => 1,
        }
    }
}

/// Occupancy of one side.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TemporaryEntry {
    /// Offset of the slot. For an empty side this is the pool's free edge.
    pub offset: usize,
    /// Size of the content.
    pub size: usize,
    /// Content id, if any.
    pub id: Option<u8>,
}

/// Result of a temporary allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TemporaryAlloc {
    /// Where the new content goes.
    pub block: Block,
    /// Which side it landed on.
    pub side: Side,
    /// Previous occupant of the chosen side, now not loaded.
    pub evicted: Option<u8>,
    /// Occupant of the other side, evicted because the new content overlapped it.
    pub overlapped: Option<u8>,
}

/// Double-buffered cache pool for streamed banks or sequences.
#[derive(Clone, Debug)]
pub struct TemporaryPool {
    pool: ArenaPool,
    entries: [TemporaryEntry; 2],
    next_side: Side,
}

impl TemporaryPool {
    /// Creates an empty temporary pool over `pool`.
    #[must_use]
    pub fn new(pool: ArenaPool) -> Self {
        let mut temporary = Self {
            pool,
            entries: [TemporaryEntry::default(); 2],
            next_side: Side::Front,
        };
        temporary.clear();
        temporary
    }

    /// Underlying arena.
    #[inline]
    #[must_use]
    pub const fn arena(&self) -> &ArenaPool {
        &self.pool
    }

    /// Occupancy of `side`.
    #[inline]
    #[must_use]
    pub const fn entry(&self, side: Side) -> &TemporaryEntry {
        &self.entries[side.index()]
    }

    /// Side preferred when both occupants are discardable.
    #[inline]
    #[must_use]
    pub const fn next_side(&self) -> Side {
        self.next_side
    }

    /// Overrides the side preferred when both occupants are discardable.
    #[inline]
    pub fn set_next_side(&mut self, side: Side) {
        self.next_side = side;
    }

    /// Finds the side holding content `id`.
    #[must_use]
    pub fn find(&self, id: u8) -> Option<(Side, Block)> {
        [Side::Front, Side::Back].into_iter().find_map(|side| {
            let entry = self.entry(side);
            (entry.id == Some(id)).then(|| (side, Block::new(entry.offset, entry.size)))
        })
    }

    /// Empties both sides and rewinds the arena.
    pub fn clear(&mut self) {
        self.pool.reset();
        self.entries[0] = TemporaryEntry {
            offset: self.pool.start(),
            size: 0,
            id: None,
        };
        self.entries[1] = TemporaryEntry {
            offset: self.pool.end(),
            size: 0,
            id: None,
        };
        self.next_side = Side::Front;
    }

    /// Places content `id` of `size` bytes on one side, evicting as needed.
    ///
    /// Every evicted id is marked [`LoadStatus::NotLoaded`] in `statuses`
    /// and reported in the returned [`TemporaryAlloc`] so the caller can
    /// discard voices or players that still reference it.
    ///
    /// # Errors
    ///
    /// [`MemoryError::SlotsBusy`] when both sides are streaming, or
    /// [`MemoryError::OutOfMemory`] when the request cannot fit the pool.
    pub fn alloc(
        &mut self,
        statuses: &mut LoadStatusTable,
        size: usize,
        id: u8,
    ) -> MemoryResult<TemporaryAlloc> {
        let size = align16(size);
        let side = self.choose_side(statuses)?;

        let fits = match side {
            Side::Front => size <= self.pool.capacity(),
            Side::Back => size + BLOCK_ALIGN <= self.pool.capacity(),
        };
        if !fits {
            return Err(MemoryError::OutOfMemory {
                requested: size,
                remaining: self.pool.capacity(),
            });
        }

        let evicted = self.entries[side.index()].id.take();
        if let Some(old) = evicted {
            statuses.set(old, LoadStatus::NotLoaded);
            tracing::debug!(kind = ?statuses.kind(), id = old, ?side, "temporary slot evicted");
        }

        let offset = match side {
            Side::Front => {
                let offset = self.pool.start();
                self.pool.set_cursor(offset + size);
                offset
            }
            Side::Back => self.pool.end() - size - BLOCK_ALIGN,
        };
        self.entries[side.index()] = TemporaryEntry {
            offset,
            size,
            id: Some(id),
        };

        let overlapped = self.resolve_overlap(side, statuses);

        // Whichever rule picked the side, the other one is preferred next.
        self.next_side = side.other();

        Ok(TemporaryAlloc {
            block: Block::new(offset, size),
            side,
            evicted,
            overlapped,
        })
    }

    fn choose_side(&self, statuses: &LoadStatusTable) -> MemoryResult<Side> {
        let status = |side: Side| {
            self.entry(side)
                .id
                .map_or(LoadStatus::NotLoaded, |id| statuses.get(id))
        };
        let front = status(Side::Front);
        let back = status(Side::Back);

        if front == LoadStatus::NotLoaded {
            return Ok(Side::Front);
        }
        if back == LoadStatus::NotLoaded {
            return Ok(Side::Back);
        }
        match (front, back) {
            (LoadStatus::Discardable, LoadStatus::Discardable) => Ok(self.next_side),
            (LoadStatus::Discardable, _) => Ok(Side::Front),
            (_, LoadStatus::Discardable) => Ok(Side::Back),
            (LoadStatus::InProgress, LoadStatus::InProgress) => Err(MemoryError::SlotsBusy),
            (LoadStatus::InProgress, _) => Ok(Side::Back),
            _ => Ok(Side::Front),
        }
    }

    /// Evicts the side opposite `placed` if the two now overlap.
    fn resolve_overlap(&mut self, placed: Side, statuses: &mut LoadStatusTable) -> Option<u8> {
        let overlap = self.entries[1].offset < self.pool.cursor();
        if !overlap {
            return None;
        }

        let victim = placed.other();
        let id = self.entries[victim.index()].id.take();
        match victim {
            Side::Back => self.entries[1].offset = self.pool.end(),
            Side::Front => self.pool.set_cursor(self.pool.start()),
        }
        self.entries[victim.index()].size = 0;

        if let Some(id) = id {
            statuses.set(id, LoadStatus::NotLoaded);
            tracing::warn!(
                kind = ?statuses.kind(),
                id,
                ?victim,
                "temporary slot overrun, occupant discarded"
            );
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::heap::Heap;
    use crate::status::ContentKind;

    fn setup(size: usize) -> (TemporaryPool, LoadStatusTable) {
        let heap = Heap::new(size).unwrap();
        let pool = TemporaryPool::new(ArenaPool::new(heap.whole()));
        (pool, LoadStatusTable::new(ContentKind::Bank, 64))
    }

    fn sides_disjoint(pool: &TemporaryPool) -> bool {
        let front = pool.entry(Side::Front);
        let back = pool.entry(Side::Back);
        front.id.is_none() || back.id.is_none() || front.offset + front.size <= back.offset
    }

    #[test]
    fn test_first_two_allocations_fill_front_then_back() {
        let (mut pool, mut statuses) = setup(0x1000);

        let first = pool.alloc(&mut statuses, 0x300, 1).unwrap();
        statuses.set(1, LoadStatus::Complete);
        let second = pool.alloc(&mut statuses, 0x300, 2).unwrap();

        assert_eq!(first.side, Side::Front);
        assert_eq!(first.block.offset(), 0);
        assert_eq!(second.side, Side::Back);
        assert_eq!(second.block.offset(), 0x1000 - 0x300 - 0x10);
        assert!(sides_disjoint(&pool));
    }

    #[test]
    fn test_discardable_sides_alternate() {
        let (mut pool, mut statuses) = setup(0x1000);
        pool.alloc(&mut statuses, 0x100, 1).unwrap();
        statuses.set(1, LoadStatus::Discardable);
        pool.alloc(&mut statuses, 0x100, 2).unwrap();
        statuses.set(2, LoadStatus::Discardable);

        let mut last = None;
        for id in 3..13u8 {
            let placed = pool.alloc(&mut statuses, 0x100, id).unwrap();
            statuses.set(id, LoadStatus::Discardable);
            if let Some(previous) = last {
                assert_ne!(previous, placed.side);
            }
            assert!(placed.evicted.is_some());
            last = Some(placed.side);
        }
    }

    #[test]
    fn test_tie_break_follows_last_chosen_side() {
        let (mut pool, mut statuses) = setup(0x1000);
        pool.alloc(&mut statuses, 0x100, 1).unwrap();
        statuses.set(1, LoadStatus::Complete);
        pool.alloc(&mut statuses, 0x100, 2).unwrap();
        statuses.set(2, LoadStatus::Complete);

        // Both complete: front is reused.
        let third = pool.alloc(&mut statuses, 0x100, 3).unwrap();
        assert_eq!(third.side, Side::Front);
        statuses.set(3, LoadStatus::Discardable);

        // Only the front occupant is discardable, so front again.
        let fourth = pool.alloc(&mut statuses, 0x100, 4).unwrap();
        assert_eq!(fourth.side, Side::Front);
        assert_eq!(pool.next_side(), Side::Back);

        // Both discardable: the older back occupant goes, not the bank just loaded.
        statuses.set(2, LoadStatus::Discardable);
        statuses.set(4, LoadStatus::Discardable);
        let fifth = pool.alloc(&mut statuses, 0x100, 5).unwrap();
        assert_eq!(fifth.side, Side::Back);
        assert_eq!(fifth.evicted, Some(2));
        assert_eq!(statuses.get(4), LoadStatus::Discardable);
    }

    #[test]
    fn test_complete_occupant_yields_to_discardable() {
        let (mut pool, mut statuses) = setup(0x1000);
        pool.alloc(&mut statuses, 0x100, 1).unwrap();
        pool.alloc(&mut statuses, 0x100, 2).unwrap();
        statuses.set(1, LoadStatus::Complete);
        statuses.set(2, LoadStatus::Discardable);

        let placed = pool.alloc(&mut statuses, 0x100, 3).unwrap();
        assert_eq!(placed.side, Side::Back);
        assert_eq!(placed.evicted, Some(2));
        assert_eq!(statuses.get(2), LoadStatus::NotLoaded);
        assert_eq!(statuses.get(1), LoadStatus::Complete);
    }

    #[test]
    fn test_streaming_occupant_is_skipped() {
        let (mut pool, mut statuses) = setup(0x1000);
        pool.alloc(&mut statuses, 0x100, 1).unwrap();
        pool.alloc(&mut statuses, 0x100, 2).unwrap();
        statuses.set(1, LoadStatus::InProgress);
        statuses.set(2, LoadStatus::Complete);

        let placed = pool.alloc(&mut statuses, 0x100, 3).unwrap();
        assert_eq!(placed.side, Side::Back);
        assert_eq!(statuses.get(1), LoadStatus::InProgress);
    }

    #[test]
    fn test_both_streaming_fails() {
        let (mut pool, mut statuses) = setup(0x1000);
        pool.alloc(&mut statuses, 0x100, 1).unwrap();
        pool.alloc(&mut statuses, 0x100, 2).unwrap();
        statuses.set(1, LoadStatus::InProgress);
        statuses.set(2, LoadStatus::InProgress);

        assert_eq!(pool.alloc(&mut statuses, 0x100, 3), Err(MemoryError::SlotsBusy));
    }

    #[test]
    fn test_overlap_evicts_streaming_other_side() {
        let (mut pool, mut statuses) = setup(0x1000);
        pool.alloc(&mut statuses, 0x100, 1).unwrap();
        statuses.set(1, LoadStatus::Complete);
        pool.alloc(&mut statuses, 0x800, 2).unwrap();
        statuses.set(2, LoadStatus::InProgress);
        statuses.set(1, LoadStatus::Discardable);

        // Front is chosen (discardable) but 0x900 runs into the back slot.
        let placed = pool.alloc(&mut statuses, 0x900, 3).unwrap();
        assert_eq!(placed.side, Side::Front);
        assert_eq!(placed.evicted, Some(1));
        assert_eq!(placed.overlapped, Some(2));
        assert_eq!(statuses.get(2), LoadStatus::NotLoaded);
        assert_eq!(pool.entry(Side::Back).offset, 0x1000);
        assert!(sides_disjoint(&pool));
    }

    #[test]
    fn test_back_overlap_rewinds_front() {
        let (mut pool, mut statuses) = setup(0x1000);
        pool.alloc(&mut statuses, 0x600, 1).unwrap();
        statuses.set(1, LoadStatus::Complete);

        let placed = pool.alloc(&mut statuses, 0xB00, 2).unwrap();
        assert_eq!(placed.side, Side::Back);
        assert_eq!(placed.overlapped, Some(1));
        assert_eq!(pool.arena().cursor(), 0);
        assert!(pool.find(1).is_none());
        assert!(sides_disjoint(&pool));
    }

    #[test]
    fn test_oversized_request_fails_cleanly() {
        let (mut pool, mut statuses) = setup(0x200);
        pool.alloc(&mut statuses, 0x100, 1).unwrap();
        statuses.set(1, LoadStatus::Complete);
        let err = pool.alloc(&mut statuses, 0x1F8, 2).unwrap_err();
        assert!(matches!(err, MemoryError::OutOfMemory { .. }));
        assert_eq!(pool.find(1).map(|(side, _)| side), Some(Side::Front));
    }

    #[test]
    fn test_clear_resets_edges() {
        let (mut pool, mut statuses) = setup(0x400);
        pool.alloc(&mut statuses, 0x100, 1).unwrap();
        pool.alloc(&mut statuses, 0x100, 2).unwrap();
        pool.clear();
        assert_eq!(pool.entry(Side::Front).offset, 0);
        assert_eq!(pool.entry(Side::Back).offset, 0x400);
        assert_eq!(pool.next_side(), Side::Front);
        assert!(pool.find(1).is_none());
    }
}
