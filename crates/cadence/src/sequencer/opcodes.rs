//! Instruction bytes.
//!
//! Control flow shares one encoding across all three levels; everything
//! else is level specific. Bytes below the level's command threshold carry
//! a 4-bit operand in the low nibble (players and channels) or a note
//! (layers).

/// End of script, or return from a call.
pub const END: u8 = 0xff;
/// Stop for this tick.
pub const YIELD: u8 = 0xfe;
/// Wait a compressed number of ticks.
pub const DELAY: u8 = 0xfd;
/// Call an absolute offset.
pub const CALL: u8 = 0xfc;
/// Jump to an absolute offset.
pub const JUMP: u8 = 0xfb;
/// Jump if the value register is zero.
pub const BEQZ: u8 = 0xfa;
/// Jump if the value register is negative.
pub const BLTZ: u8 = 0xf9;
/// Open a counted loop.
pub const LOOP: u8 = 0xf8;
/// Close the innermost loop.
pub const LOOP_END: u8 = 0xf7;
/// Drop the innermost frame.
pub const BREAK: u8 = 0xf6;
/// Jump if the value register is not negative.
pub const BGEZ: u8 = 0xf5;
/// Relative jump.
pub const JUMP_REL: u8 = 0xf4;
/// Relative jump if zero.
pub const BEQZ_REL: u8 = 0xf3;
/// Relative jump if negative.
pub const BLTZ_REL: u8 = 0xf2;
/// Reserve synthesis voices.
pub const RESERVE_VOICES: u8 = 0xf1;
/// Give reserved voices back.
pub const UNRESERVE_VOICES: u8 = 0xf0;

/// Value register: subtract.
pub const VALUE_SUB: u8 = 0xc8;
/// Value register: bitwise and.
pub const VALUE_AND: u8 = 0xc9;
/// Value register: load.
pub const VALUE_SET: u8 = 0xcc;

/// Player-only instructions.
pub mod player {
    /// Set transposition.
    pub const TRANSPOSE: u8 = 0xdf;
    /// Add to transposition.
    pub const TRANSPOSE_ADD: u8 = 0xde;
    /// Set tempo in beats per minute.
    pub const TEMPO: u8 = 0xdd;
    /// Add to tempo.
    pub const TEMPO_ADD: u8 = 0xdc;
    /// Fade target volume.
    pub const FADE_VOLUME: u8 = 0xdb;
    /// Fade state and timer.
    pub const FADE_STATE: u8 = 0xda;
    /// Fade volume scale.
    pub const FADE_SCALE: u8 = 0xd9;
    /// Allocate channels by bit mask.
    pub const INIT_CHANNELS: u8 = 0xd7;
    /// Disable channels by bit mask.
    pub const DISABLE_CHANNELS: u8 = 0xd6;
    /// Volume scale while muted.
    pub const MUTE_SCALE: u8 = 0xd5;
    /// Mute the player.
    pub const MUTE: u8 = 0xd4;
    /// What muting stops.
    pub const MUTE_BEHAVIOR: u8 = 0xd3;
    /// Short-note velocity table in sequence data.
    pub const SHORT_VELOCITIES: u8 = 0xd2;
    /// Short-note duration table in sequence data.
    pub const SHORT_DURATIONS: u8 = 0xd1;
    /// Voice allocation policy.
    pub const ALLOC_POLICY: u8 = 0xd0;

    /// `value = channel[n].finished`.
    pub const TEST_CHANNEL: u8 = 0x00;
    /// `value -= variation`.
    pub const SUB_VARIATION: u8 = 0x50;
    /// `variation = value`.
    pub const SET_VARIATION: u8 = 0x70;
    /// `value = variation`.
    pub const GET_VARIATION: u8 = 0x80;
    /// Start channel n at an absolute offset.
    pub const START_CHANNEL: u8 = 0x90;
}

/// Channel-only instructions.
pub mod channel {
    /// Stop the channel script; layers keep running.
    pub const STOP_SCRIPT: u8 = 0xea;
    /// Set the dynamic table.
    pub const DYN_TABLE: u8 = 0xc2;
    /// Replace the dynamic table with an entry of itself.
    pub const DYN_SET_DYN_TABLE: u8 = 0xc5;
    /// Call a dynamic table entry.
    pub const DYN_CALL: u8 = 0xe4;
    /// Select a bank of the set, then an instrument.
    pub const BANK_AND_INSTRUMENT: u8 = 0xeb;
    /// Select an instrument.
    pub const INSTRUMENT: u8 = 0xc1;
    /// Select a bank of the set.
    pub const BANK: u8 = 0xc6;
    /// Short note encoding.
    pub const LARGE_NOTES_OFF: u8 = 0xc3;
    /// Long note encoding.
    pub const LARGE_NOTES_ON: u8 = 0xc4;
    /// Volume.
    pub const VOLUME: u8 = 0xdf;
    /// Volume scale.
    pub const VOLUME_SCALE: u8 = 0xe0;
    /// Raw frequency scale.
    pub const FREQ_SCALE: u8 = 0xde;
    /// Pitch bend through the bend table.
    pub const PITCH_BEND: u8 = 0xd3;
    /// Pan.
    pub const PAN: u8 = 0xdd;
    /// Share of pan taken from the channel.
    pub const PAN_MIX: u8 = 0xdc;
    /// Transposition.
    pub const TRANSPOSE: u8 = 0xdb;
    /// Envelope in sequence data.
    pub const ENVELOPE: u8 = 0xda;
    /// Release rate.
    pub const RELEASE_RATE: u8 = 0xd9;
    /// Vibrato extent.
    pub const VIBRATO_EXTENT: u8 = 0xd8;
    /// Vibrato rate.
    pub const VIBRATO_RATE: u8 = 0xd7;
    /// Vibrato extent ramp.
    pub const VIBRATO_EXTENT_LINEAR: u8 = 0xe2;
    /// Vibrato rate ramp.
    pub const VIBRATO_RATE_LINEAR: u8 = 0xe1;
    /// Vibrato delay.
    pub const VIBRATO_DELAY: u8 = 0xe3;
    /// Clear vibrato and frequency scale.
    pub const RESET_VIBRATO: u8 = 0xec;
    /// Reverb amount.
    pub const REVERB: u8 = 0xd4;
    /// Reverb bus.
    pub const REVERB_INDEX: u8 = 0xe5;
    /// Write a byte of sequence data.
    pub const WRITE_SEQ: u8 = 0xc7;
    /// Read a byte of sequence data.
    pub const READ_SEQ: u8 = 0xcb;
    /// Mute behaviour.
    pub const MUTE_BEHAVIOR: u8 = 0xca;
    /// Stereo effects.
    pub const STEREO: u8 = 0xd0;
    /// Voice allocation policy.
    pub const ALLOC_POLICY: u8 = 0xd1;
    /// Envelope sustain.
    pub const SUSTAIN: u8 = 0xd2;
    /// Codebook offset.
    pub const BOOK_OFFSET: u8 = 0xe6;
    /// Eight parameters from sequence data.
    pub const PARAMS_FROM_SEQ: u8 = 0xe7;
    /// Eight inline parameters.
    pub const PARAMS: u8 = 0xe8;
    /// Note priority.
    pub const PRIORITY: u8 = 0xe9;

    /// `value = layer[n].finished`, -1 without a layer.
    pub const TEST_LAYER: u8 = 0x00;
    /// Start sibling channel n.
    pub const START_CHANNEL: u8 = 0x10;
    /// Disable sibling channel n.
    pub const DISABLE_CHANNEL: u8 = 0x20;
    /// Write the value register to a port of sibling channel n.
    pub const IO_WRITE_OTHER: u8 = 0x30;
    /// Read a port of sibling channel n.
    pub const IO_READ_OTHER: u8 = 0x40;
    /// `value -= io[n]`.
    pub const IO_SUB: u8 = 0x50;
    /// Wait n ticks.
    pub const DELAY_SHORT: u8 = 0x60;
    /// `io[n] = value`.
    pub const IO_WRITE: u8 = 0x70;
    /// `value = io[n]`.
    pub const IO_READ: u8 = 0x80;
    /// Start layer n at an absolute offset.
    pub const SET_LAYER: u8 = 0x90;
    /// Free layer n.
    pub const FREE_LAYER: u8 = 0xa0;
    /// Start layer n at a dynamic table entry.
    pub const DYN_SET_LAYER: u8 = 0xb0;
}

/// Layer-only instructions.
pub mod layer {
    /// Rest: wait without a note.
    pub const REST: u8 = 0xc0;
    /// Velocity.
    pub const VELOCITY: u8 = 0xc1;
    /// Transposition.
    pub const TRANSPOSE: u8 = 0xc2;
    /// Default play percentage.
    pub const DEFAULT_PLAY_PERCENTAGE: u8 = 0xc3;
    /// Continuous notes on.
    pub const CONTINUOUS_ON: u8 = 0xc4;
    /// Continuous notes off.
    pub const CONTINUOUS_OFF: u8 = 0xc5;
    /// Instrument override.
    pub const INSTRUMENT: u8 = 0xc6;
    /// Portamento.
    pub const PORTAMENTO: u8 = 0xc7;
    /// Portamento off.
    pub const PORTAMENTO_OFF: u8 = 0xc8;
    /// Note duration.
    pub const DURATION: u8 = 0xc9;
    /// Pan.
    pub const PAN: u8 = 0xca;
    /// Envelope in sequence data and release rate.
    pub const ENVELOPE: u8 = 0xcb;
    /// Keep the layer pan on drums.
    pub const IGNORE_DRUM_PAN: u8 = 0xcc;
    /// Velocity from the short-note table (low nibble).
    pub const VELOCITY_FROM_TABLE: u8 = 0xd0;
    /// Duration from the short-note table (low nibble).
    pub const DURATION_FROM_TABLE: u8 = 0xe0;
}
