//! # Slot Pool
//!
//! Fixed-capacity object pool with an index free list. Sequence channels,
//! layers and synthesis voices all live in one of these.

use crate::error::{MemoryError, MemoryResult};

/// A pool of `T` with a fixed number of slots.
///
/// Objects are allocated and freed individually in O(1) with no heap
/// traffic after construction. Freeing a slot twice is detected and
/// reported rather than corrupting the free list.
///
/// # Example
///
/// ```rust,ignore
/// let mut layers: SlotPool<SequenceLayer> = SlotPool::new(64);
///
/// let handle = layers.allocate(SequenceLayer::default())?;
/// layers.free(handle)?;
/// assert!(layers.free(handle).is_err()); // double free
/// ```
#[derive(Clone, Debug)]
pub struct SlotPool<T> {
    /// The storage array.
    storage: Box<[Option<T>]>,
    /// Indices of free slots; the last one is handed out next.
    free_list: Vec<u16>,
}

/// Handle to an occupied slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    index: u16,
}

impl SlotHandle {
    /// Index of the slot inside its pool.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.index as usize
    }
}

impl<T> SlotPool<T> {
    /// Creates a pool with `capacity` empty slots (at most `u16::MAX`).
    #[must_use]
    pub fn new(capacity: u16) -> Self {
        let storage: Vec<Option<T>> = (0..capacity).map(|_| None).collect();
        let free_list: Vec<u16> = (0..capacity).rev().collect();

        Self {
            storage: storage.into_boxed_slice(),
            free_list,
        }
    }

    /// Total number of slots.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Number of occupied slots.
    #[inline]
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.capacity() - self.free_list.len()
    }

    /// Number of free slots.
    #[inline]
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    /// Stores `value` in a free slot.
    ///
    /// # Errors
    ///
    /// [`MemoryError::PoolExhausted`] when every slot is taken.
    pub fn allocate(&mut self, value: T) -> MemoryResult<SlotHandle> {
        let index = self
            .free_list
            .pop()
            .ok_or(MemoryError::PoolExhausted(self.storage.len()))?;
        self.storage[usize::from(index)] = Some(value);
        Ok(SlotHandle { index })
    }

    /// Releases a slot, returning its value.
    ///
    /// # Errors
    ///
    /// [`MemoryError::InvalidHandle`] for a handle outside the pool,
    /// [`MemoryError::DoubleFree`] for a slot that is already free.
    pub fn free(&mut self, handle: SlotHandle) -> MemoryResult<T> {
        let slot = self
            .storage
            .get_mut(handle.index())
            .ok_or(MemoryError::InvalidHandle(handle.index()))?;
        let value = slot.take().ok_or(MemoryError::DoubleFree(handle.index()))?;
        self.free_list.push(handle.index);
        Ok(value)
    }

    /// Returns true if `handle` points at an occupied slot.
    #[inline]
    #[must_use]
    pub fn contains(&self, handle: SlotHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Reference to the value in `handle`'s slot.
    #[inline]
    #[must_use]
    pub fn get(&self, handle: SlotHandle) -> Option<&T> {
        self.storage.get(handle.index())?.as_ref()
    }

    /// Mutable reference to the value in `handle`'s slot.
    #[inline]
    pub fn get_mut(&mut self, handle: SlotHandle) -> Option<&mut T> {
        self.storage.get_mut(handle.index())?.as_mut()
    }

    /// Frees every slot.
    pub fn clear(&mut self) {
        for slot in self.storage.iter_mut() {
            *slot = None;
        }
        self.free_list.clear();
        // Capacity is bounded by u16 at construction.
        let capacity = u16::try_from(self.storage.len()).unwrap_or(u16::MAX);
        self.free_list.extend((0..capacity).rev());
    }

    /// Iterates over occupied slots.
    pub fn iter(&self) -> impl Iterator<Item = (SlotHandle, &T)> {
        self.storage.iter().enumerate().filter_map(|(index, slot)| {
            slot.as_ref().map(|value| (Self::handle_at(index), value))
        })
    }

    /// Iterates mutably over occupied slots.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SlotHandle, &mut T)> {
        self.storage.iter_mut().enumerate().filter_map(|(index, slot)| {
            slot.as_mut().map(|value| (Self::handle_at(index), value))
        })
    }

    #[inline]
    fn handle_at(index: usize) -> SlotHandle {
        SlotHandle {
            index: u16::try_from(index).unwrap_or(u16::MAX),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_allocate_free() {
        let mut pool: SlotPool<u32> = SlotPool::new(10);

        let h1 = pool.allocate(42).unwrap();
        assert_eq!(*pool.get(h1).unwrap(), 42);
        assert_eq!(pool.allocated_count(), 1);

        let freed = pool.free(h1).unwrap();
        assert_eq!(freed, 42);
        assert_eq!(pool.allocated_count(), 0);
    }

    #[test]
    fn test_pool_full() {
        let mut pool: SlotPool<u8> = SlotPool::new(2);

        let _ = pool.allocate(1).unwrap();
        let _ = pool.allocate(2).unwrap();
        assert_eq!(pool.allocate(3), Err(MemoryError::PoolExhausted(2)));
    }

    #[test]
    fn test_double_free_is_detected() {
        let mut pool: SlotPool<u32> = SlotPool::new(4);
        let handle = pool.allocate(7).unwrap();
        pool.free(handle).unwrap();

        assert_eq!(pool.free(handle), Err(MemoryError::DoubleFree(handle.index())));
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn test_pool_reuse() {
        let mut pool: SlotPool<u32> = SlotPool::new(1);

        let h1 = pool.allocate(1).unwrap();
        pool.free(h1).unwrap();

        let h2 = pool.allocate(2).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(*pool.get(h2).unwrap(), 2);
    }

    #[test]
    fn test_clear_and_iter() {
        let mut pool: SlotPool<u32> = SlotPool::new(3);
        let a = pool.allocate(1).unwrap();
        let _ = pool.allocate(2).unwrap();
        pool.free(a).unwrap();

        let values: Vec<u32> = pool.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![2]);

        for (_, value) in pool.iter_mut() {
            *value += 1;
        }
        assert_eq!(pool.iter().next().map(|(_, v)| *v), Some(3));

        pool.clear();
        assert_eq!(pool.allocated_count(), 0);
        assert_eq!(pool.free_count(), 3);
    }
}
