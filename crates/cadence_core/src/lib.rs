//! # Cadence Core
//!
//! Fixed-memory building blocks for a real-time sequenced audio engine:
//! - One preallocated, 16-byte aligned heap
//! - Bump arenas with nested sub-pool carving
//! - Persistent and two-sided temporary pools for streamed content
//! - Index free lists with double-free detection
//!
//! ## Architecture Rules
//!
//! 1. **No heap allocations in the tick path** - everything is reserved up front
//! 2. **Offsets, not pointers** - every block is a range of the heap
//! 3. **Failures are values** - callers degrade, they do not crash
//!
//! ## Example
//!
//! ```rust,ignore
//! use cadence_core::{ArenaPool, Heap};
//!
//! let mut heap = Heap::new(0x40000)?;
//! let mut session = ArenaPool::new(heap.whole());
//! let sequences = session.carve(&mut heap, 0x4000);
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod error;
pub mod memory;
pub mod status;

pub use error::{MemoryError, MemoryResult};
pub use memory::{
    align16, ArenaPool, Block, ContentPool, Heap, PersistentEntry, PersistentPool, Placement,
    Side, SlotHandle, SlotPool, TemporaryAlloc, TemporaryEntry, TemporaryPool, Tier, TierPolicy,
    BLOCK_ALIGN, MAX_PERSISTENT_ENTRIES,
};
pub use status::{ContentKind, LoadStatus, LoadStatusTable};
