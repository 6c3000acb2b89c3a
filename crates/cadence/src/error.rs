//! # Engine Error Types
//!
//! All errors that can occur while loading content, serving samples or
//! running sequences.

use cadence_core::{ContentKind, MemoryError};
use cadence_shared::ConfigError;
use thiserror::Error;

use crate::sequencer::ScriptError;
use crate::transfer::SlotClass;

/// Errors that can occur in the engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// A pool could not satisfy an allocation (includes fatal heap init).
    #[error("out of memory: {0}")]
    OutOfMemory(#[from] MemoryError),

    /// No sample cache slot could be recycled.
    #[error("sample cache exhausted for {class:?} slots")]
    CacheExhausted {
        /// Slot class that was requested.
        class: SlotClass,
    },

    /// A sample request is larger than any cache slot.
    #[error("sample request of {size} bytes exceeds slot size {slot_size}")]
    SampleTooLarge {
        /// Requested length.
        size: usize,
        /// Buffer size of the slot class.
        slot_size: usize,
    },

    /// Loading content failed and was abandoned.
    #[error("load of {kind:?} {id} failed: {reason}")]
    LoadFailure {
        /// Content kind.
        kind: ContentKind,
        /// Content id.
        id: u8,
        /// What went wrong.
        reason: &'static str,
    },

    /// A script faulted (stack overflow, underflow, bad program counter).
    #[error("script fault: {0}")]
    Script(#[from] ScriptError),

    /// Referenced content does not exist.
    #[error("missing {what} {id}")]
    MissingContent {
        /// What was looked up.
        what: &'static str,
        /// Its id or index.
        id: u32,
    },

    /// The archive is malformed.
    #[error("invalid archive: {0}")]
    InvalidArchive(&'static str),

    /// The transfer device rejected a request.
    #[error("transfer of {len} bytes from {address:#x} failed")]
    Transfer {
        /// Device address.
        address: u32,
        /// Length.
        len: usize,
    },

    /// Configuration was rejected.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A sequence player index is out of range.
    #[error("no sequence player {0}")]
    InvalidPlayer(u8),

    /// A session preset index is out of range.
    #[error("no session preset {0}")]
    InvalidPreset(u8),

    /// The control channel refused a command.
    #[error("control path: {0}")]
    Control(&'static str),

    /// The engine is rebuilding its session and cannot take the request.
    #[error("session reset in progress")]
    ResetInProgress,
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
