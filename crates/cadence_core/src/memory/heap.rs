//! # Audio Heap
//!
//! The one contiguous byte region every pool is carved from. It is reserved
//! once at startup and never resized; all "pointers" handed out by the pools
//! are byte offsets into it.
//!
//! The storage is kept as `u128` words so the base address is 16-byte
//! aligned, and viewed as bytes through `bytemuck`.

use bytemuck::{cast_slice, cast_slice_mut};

use crate::error::{MemoryError, MemoryResult};

/// Alignment of every block handed out by the arenas.
pub const BLOCK_ALIGN: usize = 16;

/// Rounds `size` up to the next multiple of [`BLOCK_ALIGN`].
#[inline]
#[must_use]
pub const fn align16(size: usize) -> usize {
    (size + BLOCK_ALIGN - 1) & !(BLOCK_ALIGN - 1)
}

/// A contiguous byte range inside the [`Heap`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Block {
    offset: usize,
    len: usize,
}

impl Block {
    /// Creates a block descriptor.
    ///
    /// # Arguments
    ///
    /// * `offset` - Byte offset from the heap base
    /// * `len` - Length in bytes
    #[inline]
    #[must_use]
    pub const fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    /// Byte offset from the heap base.
    #[inline]
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Length in bytes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true for a zero-length block.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One past the last byte of the block.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> usize {
        self.offset + self.len
    }

    /// Returns true when `[offset, offset + len)` lies inside this block.
    #[inline]
    #[must_use]
    pub const fn contains_range(&self, offset: usize, len: usize) -> bool {
        offset >= self.offset && offset + len <= self.end()
    }

    /// Returns the sub-block starting `start` bytes in, `len` bytes long.
    ///
    /// # Returns
    ///
    /// None if the range does not fit inside this block.
    #[must_use]
    pub fn sub(&self, start: usize, len: usize) -> Option<Self> {
        let offset = self.offset.checked_add(start)?;
        self.contains_range(offset, len).then_some(Self { offset, len })
    }
}

/// The preallocated audio heap.
///
/// # Example
///
/// ```rust,ignore
/// let mut heap = Heap::new(256 * 1024)?;
/// let mut root = ArenaPool::new(heap.whole());
/// let block = root.alloc(&mut heap, 100).expect("fits");
/// assert_eq!(block.offset() % 16, 0);
/// ```
#[derive(Debug)]
pub struct Heap {
    words: Box<[u128]>,
}

impl Heap {
    /// Reserves a zeroed heap of at least `size` bytes (rounded up to 16).
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::HeapInit`] when the host refuses the reservation.
    pub fn new(size: usize) -> MemoryResult<Self> {
        let word_count = align16(size) / BLOCK_ALIGN;
        let mut words: Vec<u128> = Vec::new();
        words
            .try_reserve_exact(word_count)
            .map_err(|_| MemoryError::HeapInit { requested: size })?;
        words.resize(word_count, 0);

        tracing::info!(bytes = word_count * BLOCK_ALIGN, "audio heap reserved");

        Ok(Self {
            words: words.into_boxed_slice(),
        })
    }

    /// Total size in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.words.len() * BLOCK_ALIGN
    }

    /// The whole heap as one block.
    #[inline]
    #[must_use]
    pub fn whole(&self) -> Block {
        Block::new(0, self.size())
    }

    /// Every byte of the heap.
    #[inline]
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        cast_slice(&self.words)
    }

    /// Every byte of the heap, mutably.
    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        cast_slice_mut(&mut self.words)
    }

    /// The bytes covered by `block`; empty if the block is out of range.
    #[inline]
    #[must_use]
    pub fn slice(&self, block: Block) -> &[u8] {
        self.bytes()
            .get(block.offset()..block.end())
            .unwrap_or_default()
    }

    /// The bytes covered by `block`, mutably; empty if out of range.
    #[inline]
    pub fn slice_mut(&mut self, block: Block) -> &mut [u8] {
        let range = block.offset()..block.end();
        self.bytes_mut().get_mut(range).unwrap_or_default()
    }

    /// Fills `block` with zeroes.
    #[inline]
    pub fn zero(&mut self, block: Block) {
        self.slice_mut(block).fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align16() {
        assert_eq!(align16(0), 0);
        assert_eq!(align16(1), 16);
        assert_eq!(align16(16), 16);
        assert_eq!(align16(17), 32);
    }

    #[test]
    fn test_heap_rounds_up_and_is_aligned() {
        let heap = Heap::new(100).unwrap();
        assert_eq!(heap.size(), 112);
        assert_eq!(heap.bytes().as_ptr() as usize % BLOCK_ALIGN, 0);
        assert!(heap.bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_block_sub_range() {
        let block = Block::new(32, 64);
        assert_eq!(block.sub(16, 16), Some(Block::new(48, 16)));
        assert!(block.sub(60, 8).is_none());
        assert!(block.contains_range(32, 64));
        assert!(!block.contains_range(31, 2));
    }

    #[test]
    fn test_out_of_range_slice_is_empty() {
        let heap = Heap::new(64).unwrap();
        assert!(heap.slice(Block::new(48, 32)).is_empty());
        assert_eq!(heap.slice(Block::new(16, 16)).len(), 16);
    }
}
