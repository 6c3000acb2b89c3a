//! # Arena Pool
//!
//! A bump allocator over a range of the audio heap. Allocations are freed all
//! at once when the pool is reset for the next session.

use super::heap::{align16, Block, Heap};

/// A bump-pointer pool covering one [`Block`] of the heap.
///
/// Invariant: `start <= cursor <= start + size`. Every block it returns is
/// 16-byte aligned (relative to the aligned heap base) and zero-filled.
/// Sub-pools are carved out of a parent's cursor, so ownership forms a tree
/// rooted at the heap.
///
/// # Example
///
/// ```rust,ignore
/// let mut session = ArenaPool::new(heap.whole());
/// let mut sequences = session.carve(&mut heap, 0x4000).expect("fits");
///
/// let block = sequences.alloc(&mut heap, 0x180).expect("fits");
///
/// // Next session starts from scratch
/// session.reset();
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArenaPool {
    /// First byte owned by the pool.
    start: usize,
    /// Next free byte.
    cursor: usize,
    /// Total bytes owned by the pool.
    size: usize,
    /// Allocations since the last reset.
    count: u32,
}

impl ArenaPool {
    /// Creates a pool over `block`, trimming the block to 16-byte bounds.
    #[must_use]
    pub const fn new(block: Block) -> Self {
        let start = align16(block.offset());
        let size = if block.end() > start {
            (block.end() - start) & !0xF
        } else {
            0
        };
        Self {
            start,
            cursor: start,
            size,
            count: 0,
        }
    }

    /// First byte owned by the pool.
    #[inline]
    #[must_use]
    pub const fn start(&self) -> usize {
        self.start
    }

    /// One past the last byte owned by the pool.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> usize {
        self.start + self.size
    }

    /// Total capacity in bytes.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.size
    }

    /// Next free byte.
    #[inline]
    #[must_use]
    pub const fn cursor(&self) -> usize {
        self.cursor
    }

    /// Bytes handed out since the last reset.
    #[inline]
    #[must_use]
    pub const fn used(&self) -> usize {
        self.cursor - self.start
    }

    /// Bytes still available.
    #[inline]
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.end() - self.cursor
    }

    /// Allocations since the last reset.
    #[inline]
    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }

    /// The whole range owned by the pool.
    #[inline]
    #[must_use]
    pub const fn block(&self) -> Block {
        Block::new(self.start, self.size)
    }

    /// Allocates `size` bytes, rounded up to 16.
    ///
    /// # Arguments
    ///
    /// * `heap` - The heap the pool lives in (used for zero-filling)
    /// * `size` - Requested size in bytes
    ///
    /// # Returns
    ///
    /// A zero-filled block, or None if the pool is out of space.
    pub fn alloc(&mut self, heap: &mut Heap, size: usize) -> Option<Block> {
        let aligned = align16(size);
        if aligned > self.remaining() {
            tracing::debug!(
                requested = aligned,
                remaining = self.remaining(),
                "arena pool exhausted"
            );
            return None;
        }

        let block = Block::new(self.cursor, aligned);
        heap.zero(block);
        self.cursor += aligned;
        self.count += 1;
        Some(block)
    }

    /// Carves a child pool of `size` bytes out of this one.
    ///
    /// # Returns
    ///
    /// The child pool, or None if this pool cannot hold it.
    pub fn carve(&mut self, heap: &mut Heap, size: usize) -> Option<Self> {
        self.alloc(heap, size).map(Self::new)
    }

    /// Rewinds the cursor to the start, invalidating every allocation.
    ///
    /// Idempotent: resetting twice leaves the same state as resetting once.
    #[inline]
    pub fn reset(&mut self) {
        self.cursor = self.start;
        self.count = 0;
    }

    /// Moves the cursor to `offset`, clamped to the pool bounds.
    ///
    /// Used by the two-sided temporary pool, which places its front slot by
    /// hand rather than bumping.
    #[inline]
    pub(crate) fn set_cursor(&mut self, offset: usize) {
        self.cursor = offset.clamp(self.start, self.end());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_allocation_is_aligned_and_zeroed() {
        let mut heap = Heap::new(1024).unwrap();
        heap.bytes_mut().fill(0xAB);
        let mut pool = ArenaPool::new(heap.whole());

        let a = pool.alloc(&mut heap, 10).unwrap();
        let b = pool.alloc(&mut heap, 33).unwrap();

        assert_eq!(a.offset() % 16, 0);
        assert_eq!(b.offset() % 16, 0);
        assert_eq!(a.len(), 16);
        assert_eq!(b.offset(), 16);
        assert!(heap.slice(a).iter().all(|&x| x == 0));
        assert!(heap.slice(b).iter().all(|&x| x == 0));
        assert_eq!(pool.count(), 2);
    }

    #[test]
    fn test_arena_exhaustion_returns_none() {
        let mut heap = Heap::new(64).unwrap();
        let mut pool = ArenaPool::new(heap.whole());
        assert!(pool.alloc(&mut heap, 48).is_some());
        assert!(pool.alloc(&mut heap, 17).is_none());
        assert!(pool.alloc(&mut heap, 16).is_some());
        assert_eq!(pool.remaining(), 0);
    }

    #[test]
    fn test_arena_reset_is_idempotent() {
        let mut heap = Heap::new(256).unwrap();
        let mut pool = ArenaPool::new(heap.whole());
        let _ = pool.alloc(&mut heap, 100).unwrap();

        pool.reset();
        let once = pool;
        pool.reset();
        assert_eq!(pool, once);
        assert_eq!(pool.used(), 0);
        assert_eq!(pool.count(), 0);
    }

    #[test]
    fn test_carve_sub_pool() {
        let mut heap = Heap::new(1024).unwrap();
        let mut root = ArenaPool::new(heap.whole());
        let _ = root.alloc(&mut heap, 8).unwrap();

        let mut child = root.carve(&mut heap, 100).unwrap();
        assert_eq!(child.start(), 16);
        assert_eq!(child.capacity(), 112);
        assert_eq!(root.cursor(), 128);

        let inner = child.alloc(&mut heap, 112).unwrap();
        assert_eq!(inner.offset(), 16);
        assert!(child.alloc(&mut heap, 1).is_none());
    }

    #[test]
    fn test_unaligned_block_is_trimmed() {
        let pool = ArenaPool::new(Block::new(5, 40));
        assert_eq!(pool.start(), 16);
        assert_eq!(pool.capacity(), 16);
    }
}
