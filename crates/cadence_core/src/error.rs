//! # Memory Error Types
//!
//! All errors that can occur while carving or filling the audio heap.

use thiserror::Error;

/// Errors raised by the heap, the arena pools and the slot pools.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// The backing heap could not be reserved. Fatal at startup.
    #[error("heap initialisation failed: could not reserve {requested} bytes")]
    HeapInit {
        /// Size that was requested.
        requested: usize,
    },

    /// An arena had not enough room left for the request.
    #[error("out of memory: requested {requested} bytes, {remaining} remaining")]
    OutOfMemory {
        /// Aligned size of the request.
        requested: usize,
        /// Bytes still free in the arena.
        remaining: usize,
    },

    /// The persistent pool's tracking table is full.
    #[error("persistent entry table full ({capacity} entries)")]
    EntryTableFull {
        /// Maximum number of tracked entries.
        capacity: usize,
    },

    /// Both temporary slots hold content that is still streaming in.
    #[error("both temporary slots are mid-transfer")]
    SlotsBusy,

    /// A slot pool has no free slot left.
    #[error("slot pool exhausted (capacity {0})")]
    PoolExhausted(usize),

    /// A slot was released twice.
    #[error("double free of slot {0}")]
    DoubleFree(usize),

    /// A handle pointed outside of its pool.
    #[error("invalid slot handle {0}")]
    InvalidHandle(usize),
}

/// Result type for memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;
