//! # Memory Management
//!
//! The audio heap and every pool carved from it.
//!
//! ## Design Philosophy
//!
//! All memory is reserved once at startup. During playback:
//! - No heap allocations
//! - Whole pools are reset per session, never freed piecemeal
//! - Allocation failure is a value, never a panic
//!
//! ```text
//! Heap
//!  ├── init pool            (archive directories)
//!  └── session pool         (rebuilt on every session reset)
//!       ├── notes & buffers (sample cache slots, resident samples)
//!       └── sequences & banks
//!            ├── persistent ── seq / bank
//!            └── temporary  ── seq / bank (two-sided)
//! ```

mod arena;
mod content;
mod heap;
mod persistent;
mod slot;
mod temporary;

pub use arena::ArenaPool;
pub use content::{ContentPool, Placement, Tier, TierPolicy};
pub use heap::{align16, Block, Heap, BLOCK_ALIGN};
pub use persistent::{PersistentEntry, PersistentPool, MAX_PERSISTENT_ENTRIES};
pub use slot::{SlotHandle, SlotPool};
pub use temporary::{Side, TemporaryAlloc, TemporaryEntry, TemporaryPool};
