//! # Sample Transfer Cache
//!
//! Sample data stays on the device; the synthesizer asks for small windows
//! of it every tick. This cache keeps a fixed set of slot buffers holding
//! recently transferred windows so repeated reads of the same region cost
//! nothing.
//!
//! ## Design
//!
//! Slots come in two lifetime classes, partitioned by a split index inside
//! one flat array:
//!
//! ```text
//! slots: [ short-lived ........ | long-lived .... ]
//!          ttl = 2                ttl = 60
//! ```
//!
//! Each class has a circular reuse queue of slot indices. A slot whose TTL
//! runs out is pushed at the queue head; misses pop from the tail. A hit on
//! a queued slot splices it out by moving the tail entry into its place.

use cadence_core::{ArenaPool, Block, Heap};
use cadence_shared::constants::{LONG_LIVED_TTL, MAX_CACHE_SLOTS, SHORT_LIVED_TTL};
use cadence_shared::SessionPreset;
use crossbeam_channel::Sender;

use super::{DeviceAddr, TransferDevice, TransferDone, TransferRequest};
use crate::error::{EngineError, EngineResult};

/// Lifetime class of a cache slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SlotClass {
    /// Recycled two ticks after its last hit.
    ShortLived,
    /// Recycled sixty ticks after its last hit.
    LongLived,
}

impl SlotClass {
    /// Ticks a slot of this class survives without a hit.
    #[inline]
    #[must_use]
    pub const fn ttl(self) -> u8 {
        match self {
            Self::ShortLived => SHORT_LIVED_TTL,
            Self::LongLived => LONG_LIVED_TTL,
        }
    }
}

/// Where a requested sample window can be read once its transfer lands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleView {
    /// Cache slot serving the request.
    pub slot: u8,
    /// Heap offset of the first requested byte.
    pub offset: usize,
    /// Requested length.
    pub len: usize,
}

impl SampleView {
    /// The view as a heap block.
    #[inline]
    #[must_use]
    pub const fn block(&self) -> Block {
        Block::new(self.offset, self.len)
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct CacheSlot {
    buffer: Block,
    source: Option<DeviceAddr>,
    ttl: u8,
    reuse_index: u8,
    queued: bool,
}

/// Circular queue of slot indices with wrapping byte cursors.
#[derive(Clone, Debug)]
struct ReuseQueue {
    entries: [u8; 256],
    head: u8,
    tail: u8,
}

impl Default for ReuseQueue {
    fn default() -> Self {
        Self {
            entries: [0; 256],
            head: 0,
            tail: 0,
        }
    }
}

impl ReuseQueue {
    fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    fn len(&self) -> usize {
        usize::from(self.head.wrapping_sub(self.tail))
    }

    fn push(&mut self, slots: &mut [CacheSlot], index: u8) {
        self.entries[usize::from(self.head)] = index;
        if let Some(slot) = slots.get_mut(usize::from(index)) {
            slot.reuse_index = self.head;
            slot.queued = true;
        }
        self.head = self.head.wrapping_add(1);
    }

    fn pop(&mut self, slots: &mut [CacheSlot]) -> Option<u8> {
        if self.is_empty() {
            return None;
        }
        let index = self.entries[usize::from(self.tail)];
        self.tail = self.tail.wrapping_add(1);
        if let Some(slot) = slots.get_mut(usize::from(index)) {
            slot.queued = false;
        }
        Some(index)
    }

    /// Removes the slot at queue position `position` by moving the tail
    /// entry into its place.
    fn splice(&mut self, slots: &mut [CacheSlot], position: u8) {
        if position != self.tail {
            let moved = self.entries[usize::from(self.tail)];
            self.entries[usize::from(position)] = moved;
            if let Some(slot) = slots.get_mut(usize::from(moved)) {
                slot.reuse_index = position;
            }
        }
        self.tail = self.tail.wrapping_add(1);
    }
}

/// Fixed set of sample transfer buffers with TTL-based recycling.
pub struct SampleCache {
    slots: Vec<CacheSlot>,
    split: usize,
    short_queue: ReuseQueue,
    long_queue: ReuseQueue,
    reply: Option<Sender<TransferDone>>,
    hits: u64,
    misses: u64,
}

impl Default for SampleCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleCache {
    /// Creates an empty cache; [`SampleCache::rebuild`] gives it slots.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::with_capacity(MAX_CACHE_SLOTS),
            split: 0,
            short_queue: ReuseQueue::default(),
            long_queue: ReuseQueue::default(),
            reply: None,
            hits: 0,
            misses: 0,
        }
    }

    /// Carves slot buffers for `preset` out of `pool` and queues every slot
    /// for reuse. Completions of the cache's transfers go to `reply`.
    ///
    /// Stops early (with fewer slots) if `pool` runs out of space.
    ///
    /// # Errors
    ///
    /// Out of memory if not even one slot of each class fits.
    pub fn rebuild(
        &mut self,
        heap: &mut Heap,
        pool: &mut ArenaPool,
        preset: &SessionPreset,
        reply: Sender<TransferDone>,
    ) -> EngineResult<()> {
        self.slots.clear();
        self.short_queue = ReuseQueue::default();
        self.long_queue = ReuseQueue::default();
        self.reply = Some(reply);

        let short = preset.short_lived_slots().min(MAX_CACHE_SLOTS);
        let long = preset.long_lived_slots().min(MAX_CACHE_SLOTS - short);

        for _ in 0..short {
            let Some(buffer) = pool.alloc(heap, preset.short_slot_size) else {
                break;
            };
            self.slots.push(CacheSlot {
                buffer,
                ..CacheSlot::default()
            });
        }
        self.split = self.slots.len();
        for _ in 0..long {
            let Some(buffer) = pool.alloc(heap, preset.long_slot_size) else {
                break;
            };
            self.slots.push(CacheSlot {
                buffer,
                ..CacheSlot::default()
            });
        }

        if self.split == 0 || self.slots.len() == self.split {
            return Err(EngineError::OutOfMemory(cadence_core::MemoryError::OutOfMemory {
                requested: preset.long_slot_size,
                remaining: pool.remaining(),
            }));
        }
        if self.slots.len() < short + long {
            tracing::warn!(
                wanted = short + long,
                got = self.slots.len(),
                "sample cache built with fewer slots than the preset asks for"
            );
        }

        for index in 0..self.slots.len() {
            let index = u8::try_from(index).unwrap_or(u8::MAX);
            self.enqueue(index);
        }

        tracing::debug!(
            short = self.split,
            long = self.slots.len() - self.split,
            "sample cache rebuilt"
        );
        Ok(())
    }

    /// Drops every slot. Requests fail with
    /// [`EngineError::CacheExhausted`] until the next rebuild.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.split = 0;
        self.short_queue = ReuseQueue::default();
        self.long_queue = ReuseQueue::default();
    }

    /// Total number of slots.
    #[inline]
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Slots of `class` currently waiting in the reuse queue.
    #[must_use]
    pub fn reusable(&self, class: SlotClass) -> usize {
        match class {
            SlotClass::ShortLived => self.short_queue.len(),
            SlotClass::LongLived => self.long_queue.len(),
        }
    }

    /// Requests served without a transfer.
    #[inline]
    #[must_use]
    pub const fn hits(&self) -> u64 {
        self.hits
    }

    /// Requests that issued a transfer.
    #[inline]
    #[must_use]
    pub const fn misses(&self) -> u64 {
        self.misses
    }

    /// Returns a view of `[addr, addr + size)`, transferring it if needed.
    ///
    /// # Errors
    ///
    /// [`EngineError::SampleTooLarge`] if no slot can hold `size` bytes,
    /// [`EngineError::CacheExhausted`] if no slot can be recycled, or the
    /// device's error if the transfer is refused.
    pub fn request(
        &mut self,
        device: &mut dyn TransferDevice,
        addr: DeviceAddr,
        size: usize,
        class: SlotClass,
    ) -> EngineResult<SampleView> {
        if let Some(view) = self.lookup(addr, size, class) {
            self.hits += 1;
            return Ok(view);
        }

        let index = self.recycle(class)?;
        let slot_index = usize::from(index);
        let slot_size = self.slots[slot_index].buffer.len();
        let source = addr & !0xF;
        let skew = (addr - source) as usize;
        if size + skew > slot_size {
            // Give the slot straight back.
            self.enqueue(index);
            return Err(EngineError::SampleTooLarge { size, slot_size });
        }

        let buffer = self.slots[slot_index].buffer;
        let Some(reply) = self.reply.clone() else {
            return Err(EngineError::CacheExhausted { class });
        };
        if let Err(err) = device.submit(TransferRequest {
            source,
            dest: buffer,
            tag: u32::from(index),
            reply,
        }) {
            self.enqueue(index);
            return Err(err);
        }

        let ttl = self.class_of(index).ttl();
        let slot = &mut self.slots[slot_index];
        slot.source = Some(source);
        slot.ttl = ttl;
        self.misses += 1;

        Ok(SampleView {
            slot: index,
            offset: buffer.offset() + skew,
            len: size,
        })
    }

    /// Ages every active slot by one tick, queueing the ones that expire.
    pub fn decay(&mut self) {
        for index in 0..self.slots.len() {
            let slot = &mut self.slots[index];
            if slot.ttl == 0 {
                continue;
            }
            slot.ttl -= 1;
            if slot.ttl == 0 {
                let index = u8::try_from(index).unwrap_or(u8::MAX);
                self.enqueue(index);
            }
        }
    }

    fn lookup(&mut self, addr: DeviceAddr, size: usize, class: SlotClass) -> Option<SampleView> {
        let range = match class {
            SlotClass::ShortLived => 0..self.split,
            SlotClass::LongLived => self.split..self.slots.len(),
        };

        for index in range {
            let slot = self.slots[index];
            let Some(source) = slot.source else {
                continue;
            };
            let Some(delta) = addr.checked_sub(source) else {
                continue;
            };
            let delta = delta as usize;
            if delta + size > slot.buffer.len() {
                continue;
            }

            let index = u8::try_from(index).ok()?;
            if slot.queued {
                let position = slot.reuse_index;
                let (queue, slots) = self.queue_and_slots(index);
                queue.splice(slots, position);
                self.slots[usize::from(index)].queued = false;
            }
            self.slots[usize::from(index)].ttl = class.ttl();

            return Some(SampleView {
                slot: index,
                offset: slot.buffer.offset() + delta,
                len: size,
            });
        }
        None
    }

    fn recycle(&mut self, class: SlotClass) -> EngineResult<u8> {
        if class == SlotClass::LongLived {
            if let Some(index) = self.long_queue.pop(&mut self.slots) {
                return Ok(index);
            }
        }
        self.short_queue
            .pop(&mut self.slots)
            .ok_or(EngineError::CacheExhausted { class })
    }

    fn class_of(&self, index: u8) -> SlotClass {
        if usize::from(index) < self.split {
            SlotClass::ShortLived
        } else {
            SlotClass::LongLived
        }
    }

    fn enqueue(&mut self, index: u8) {
        let (queue, slots) = self.queue_and_slots(index);
        queue.push(slots, index);
    }

    fn queue_and_slots(&mut self, index: u8) -> (&mut ReuseQueue, &mut [CacheSlot]) {
        let queue = if usize::from(index) < self.split {
            &mut self.short_queue
        } else {
            &mut self.long_queue
        };
        (queue, &mut self.slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{CompletionQueue, RomDevice};

    fn setup(voices: u8) -> (Heap, SampleCache, RomDevice, CompletionQueue) {
        let preset = SessionPreset {
            max_voices: voices,
            short_slot_size: 0x20,
            long_slot_size: 0x40,
            ..SessionPreset::default()
        };
        let mut heap = Heap::new(0x2000).unwrap();
        let mut pool = ArenaPool::new(heap.whole());
        let queue = CompletionQueue::new(64);
        let mut cache = SampleCache::new();
        cache
            .rebuild(&mut heap, &mut pool, &preset, queue.reply_to())
            .unwrap();
        let rom = RomDevice::new((0..=255u8).cycle().take(0x1000).collect(), 0);
        (heap, cache, rom, queue)
    }

    #[test]
    fn test_rebuild_partitions_slots() {
        let (_, cache, _, _) = setup(2);
        assert_eq!(cache.slot_count(), 8);
        assert_eq!(cache.reusable(SlotClass::ShortLived), 6);
        assert_eq!(cache.reusable(SlotClass::LongLived), 2);
    }

    #[test]
    fn test_hit_inside_cached_window() {
        let (_, mut cache, mut rom, _) = setup(2);
        let first = cache
            .request(&mut rom, 0x100, 4, SlotClass::ShortLived)
            .unwrap();
        assert_eq!(rom.submitted(), 1);

        let second = cache
            .request(&mut rom, 0x102, 4, SlotClass::ShortLived)
            .unwrap();
        assert_eq!(rom.submitted(), 1);
        assert_eq!(second.slot, first.slot);
        assert_eq!(second.offset, first.offset + 2);
        assert_eq!(cache.hits(), 1);
    }

    #[test]
    fn test_unaligned_miss_transfers_aligned_window() {
        let (mut heap, mut cache, mut rom, queue) = setup(1);
        let view = cache
            .request(&mut rom, 0x105, 3, SlotClass::ShortLived)
            .unwrap();
        rom.service(&mut heap);
        assert!(queue.poll().is_some());
        assert_eq!(heap.slice(view.block()), &[0x05, 0x06, 0x07]);
    }

    #[test]
    fn test_ttl_decay_requeues_after_exact_passes() {
        let (_, mut cache, mut rom, _) = setup(1);
        let view = cache
            .request(&mut rom, 0x40, 8, SlotClass::ShortLived)
            .unwrap();
        let queued = cache.reusable(SlotClass::ShortLived);

        cache.decay();
        assert_eq!(cache.reusable(SlotClass::ShortLived), queued);
        cache.decay();
        assert_eq!(cache.reusable(SlotClass::ShortLived), queued + 1);

        // A hit on the queued slot pulls it back out.
        let again = cache
            .request(&mut rom, 0x40, 8, SlotClass::ShortLived)
            .unwrap();
        assert_eq!(again.slot, view.slot);
        assert_eq!(cache.reusable(SlotClass::ShortLived), queued);
        assert_eq!(rom.submitted(), 1);
    }

    #[test]
    fn test_exhaustion_is_reported() {
        let (_, mut cache, mut rom, _) = setup(1);
        for i in 0..3u32 {
            cache
                .request(&mut rom, i * 0x100, 8, SlotClass::ShortLived)
                .unwrap();
        }
        let err = cache
            .request(&mut rom, 0x800, 8, SlotClass::ShortLived)
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::CacheExhausted {
                class: SlotClass::ShortLived
            }
        );
    }

    #[test]
    fn test_long_lived_falls_back_to_short_queue() {
        let (_, mut cache, mut rom, _) = setup(1);
        let a = cache.request(&mut rom, 0x000, 8, SlotClass::LongLived).unwrap();
        let b = cache.request(&mut rom, 0x200, 8, SlotClass::LongLived).unwrap();
        assert_eq!(usize::from(a.slot), 3);
        assert!(usize::from(b.slot) < 3);
    }

    #[test]
    fn test_oversized_request_returns_slot() {
        let (_, mut cache, mut rom, _) = setup(1);
        let before = cache.reusable(SlotClass::ShortLived);
        let err = cache
            .request(&mut rom, 0x10, 0x30, SlotClass::ShortLived)
            .unwrap_err();
        assert!(matches!(err, EngineError::SampleTooLarge { .. }));
        assert_eq!(cache.reusable(SlotClass::ShortLived), before);
        assert_eq!(rom.submitted(), 0);
    }
}
