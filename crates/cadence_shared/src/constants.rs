//! # Engine Constants
//!
//! Limits baked into the engine. The archive format depends on several of
//! these; changing them requires rebuilding archives.

// =============================================================================
// CONTENT IDS
// =============================================================================

/// Number of bank ids tracked by the load status table.
pub const MAX_BANKS: usize = 64;

/// Number of sequence ids tracked by the load status table.
pub const MAX_SEQUENCES: usize = 256;

/// Maximum banks a sequence's bank set may list.
pub const MAX_BANKS_PER_SET: usize = 16;

/// Alignment of every arena allocation.
pub const ARENA_ALIGN: usize = 16;

// =============================================================================
// STREAMING
// =============================================================================

/// Largest single asynchronous transfer.
pub const TRANSFER_CHUNK_SIZE: usize = 0x1000;

/// Bank header copied synchronously before the body is streamed.
pub const BANK_HEADER_SIZE: usize = 0x10;

/// Sequence prefix copied synchronously before the rest is streamed.
pub const SEQUENCE_HEADER_SIZE: usize = 0x40;

/// Worst-case wait for in-flight transfers during a session reset.
pub const DEFAULT_RESET_DRAIN_MS: u32 = 3000;

// =============================================================================
// SAMPLE CACHE
// =============================================================================

/// Hard cap on sample cache slots (reuse queue indices are bytes).
pub const MAX_CACHE_SLOTS: usize = 0x60;

/// Ticks a short-lived slot survives without a hit.
pub const SHORT_LIVED_TTL: u8 = 2;

/// Ticks a long-lived slot survives without a hit.
pub const LONG_LIVED_TTL: u8 = 60;

/// Short-lived slots per simultaneous voice.
pub const SHORT_LIVED_SLOTS_PER_VOICE: usize = 3;

// =============================================================================
// SEQUENCER
// =============================================================================

/// Channels a player can drive.
pub const CHANNELS_PER_PLAYER: usize = 16;

/// Layers a channel can drive.
pub const LAYERS_PER_CHANNEL: usize = 4;

/// Call / loop nesting depth of every script level.
pub const SCRIPT_STACK_DEPTH: usize = 4;

/// Instructions one script may run in a single tick before it is treated as stuck.
pub const SCRIPT_INSTRUCTIONS_PER_TICK: usize = 0x400;

/// I/O ports per channel shared with the host.
pub const CHANNEL_IO_PORTS: usize = 8;

/// Tempo units per beat.
pub const TATUMS_PER_BEAT: u16 = 48;

/// Tempo a freshly initialised player runs at, in beats per minute.
pub const DEFAULT_TEMPO_BPM: u16 = 120;

/// Note priority of a freshly initialised channel.
pub const NOTE_PRIORITY_DEFAULT: u8 = 3;

/// Notes at or above this semitone cannot be played.
pub const NOTE_LIMIT: i32 = 0x80;

/// Centre pan position.
pub const PAN_CENTRE: u8 = 0x40;
