//! # Engine Configuration
//!
//! Heap layout, timing and session presets, loaded once at startup from TOML.
//!
//! ```toml
//! heap_size = 262144
//! init_pool_size = 11264
//! refresh_rate = 60
//!
//! [[presets]]
//! frequency = 32000
//! max_voices = 16
//! persistent_seq_mem = 8192
//! persistent_bank_mem = 16384
//! temporary_seq_mem = 16384
//! temporary_bank_mem = 57344
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::constants::{
    ARENA_ALIGN, DEFAULT_RESET_DRAIN_MS, MAX_CACHE_SLOTS, SHORT_LIVED_SLOTS_PER_VOICE, TATUMS_PER_BEAT,
};
use crate::error::{ConfigError, ConfigResult};
use crate::tables::TuningTables;

/// `size` rounded up the way an arena rounds it.
const fn aligned(size: usize) -> usize {
    (size + ARENA_ALIGN - 1) & !(ARENA_ALIGN - 1)
}

/// Memory split and output settings applied on every session reset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionPreset {
    /// Output sample rate in Hz.
    pub frequency: u32,
    /// Simultaneous voices; also sizes the sample cache.
    pub max_voices: u8,
    /// Master volume handed to the synthesizer.
    pub volume: u16,
    /// Persistent sequence tier, bytes.
    pub persistent_seq_mem: usize,
    /// Persistent bank tier, bytes.
    pub persistent_bank_mem: usize,
    /// Temporary (two-sided) sequence tier, bytes.
    pub temporary_seq_mem: usize,
    /// Temporary (two-sided) bank tier, bytes.
    pub temporary_bank_mem: usize,
    /// Buffer size of a short-lived sample cache slot.
    pub short_slot_size: usize,
    /// Buffer size of a long-lived sample cache slot.
    pub long_slot_size: usize,
}

impl Default for SessionPreset {
    fn default() -> Self {
        Self {
            frequency: 32_000,
            max_voices: 16,
            volume: 0x7FFF,
            persistent_seq_mem: 0x2000,
            persistent_bank_mem: 0x4000,
            temporary_seq_mem: 0x4000,
            temporary_bank_mem: 0xE000,
            short_slot_size: 0x200,
            long_slot_size: 0x400,
        }
    }
}

impl SessionPreset {
    /// Short-lived cache slots for this preset.
    #[inline]
    #[must_use]
    pub fn short_lived_slots(&self) -> usize {
        usize::from(self.max_voices) * SHORT_LIVED_SLOTS_PER_VOICE
    }

    /// Long-lived cache slots for this preset.
    #[inline]
    #[must_use]
    pub fn long_lived_slots(&self) -> usize {
        usize::from(self.max_voices)
    }

    /// Bytes a session carves for this preset: every content tier and
    /// cache slot rounded up to the arena alignment.
    #[must_use]
    pub fn carved_mem(&self) -> usize {
        let content = aligned(self.persistent_seq_mem)
            + aligned(self.temporary_seq_mem)
            + aligned(self.persistent_bank_mem)
            + aligned(self.temporary_bank_mem);
        content
            + self.short_lived_slots() * aligned(self.short_slot_size)
            + self.long_lived_slots() * aligned(self.long_slot_size)
    }

    /// Bytes of the sequence + bank region.
    #[inline]
    #[must_use]
    pub const fn content_mem(&self) -> usize {
        self.persistent_seq_mem
            + self.persistent_bank_mem
            + self.temporary_seq_mem
            + self.temporary_bank_mem
    }
}

/// Top-level engine configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Size of the single audio heap.
    pub heap_size: usize,
    /// Bytes reserved at the bottom of the heap for archive directories.
    pub init_pool_size: usize,
    /// Host frames per second.
    pub refresh_rate: u32,
    /// Tempo units per beat.
    pub tatums_per_beat: u16,
    /// Frame-length divisor of the tempo formula (milliseconds per frame).
    pub tempo_divisor: f32,
    /// Sequence players.
    pub players: u8,
    /// Global channel pool size.
    pub channels: u16,
    /// Global layer pool size.
    pub layers: u16,
    /// Worst-case wait for in-flight transfers during a session reset.
    pub reset_drain_ms: u32,
    /// Session presets, selected by index on reset.
    pub presets: Vec<SessionPreset>,
    /// Replacement tuning tables; the standard tables are used when absent.
    pub tuning: Option<TuningTables>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heap_size: 0x40000,
            init_pool_size: 0x2C00,
            refresh_rate: 60,
            tatums_per_beat: TATUMS_PER_BEAT,
            tempo_divisor: 16.713,
            players: 3,
            channels: 48,
            layers: 64,
            reset_drain_ms: DEFAULT_RESET_DRAIN_MS,
            presets: vec![SessionPreset::default()],
            tuning: None,
        }
    }
}

impl EngineConfig {
    /// Parses a configuration from TOML text and validates it.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for bad syntax, or any validation error.
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML configuration file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] when the file cannot be read, otherwise as
    /// [`EngineConfig::from_toml_str`].
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&text)
    }

    /// Serialises the configuration to TOML.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Serialise`] if a value has no TOML representation.
    pub fn to_toml_string(&self) -> ConfigResult<String> {
        toml::to_string(self).map_err(|e| ConfigError::Serialise(e.to_string()))
    }

    /// Preset `index`, if it exists.
    #[inline]
    #[must_use]
    pub fn preset(&self, index: usize) -> Option<&SessionPreset> {
        self.presets.get(index)
    }

    /// Checks limits and that every preset fits in the heap.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidValue`] naming the first bad field.
    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |field: &'static str, reason: String| {
            Err(ConfigError::InvalidValue { field, reason })
        };

        if u32::try_from(self.heap_size).is_err() {
            return invalid("heap_size", "heap offsets must fit in 32 bits".into());
        }
        if self.init_pool_size >= self.heap_size {
            return invalid("init_pool_size", "must be smaller than heap_size".into());
        }
        if self.refresh_rate == 0 {
            return invalid("refresh_rate", "must be non-zero".into());
        }
        if self.tatums_per_beat == 0 || self.tempo_divisor <= 0.0 {
            return invalid("tatums_per_beat", "tempo parameters must be positive".into());
        }
        if self.players == 0 {
            return invalid("players", "at least one player is required".into());
        }
        if self.presets.is_empty() {
            return invalid("presets", "at least one preset is required".into());
        }
        if let Some(tuning) = &self.tuning {
            tuning.validate()?;
        }

        // Arenas round every carve up to 16 bytes and trim their own end.
        let session = self.heap_size.saturating_sub(aligned(self.init_pool_size)) & !(ARENA_ALIGN - 1);
        for preset in &self.presets {
            if preset.frequency == 0 || preset.max_voices == 0 {
                return invalid("presets.frequency", "frequency and voices must be non-zero".into());
            }
            let slots = preset.short_lived_slots() + preset.long_lived_slots();
            if slots > MAX_CACHE_SLOTS {
                return invalid(
                    "presets.max_voices",
                    format!("{slots} cache slots exceed the limit of {MAX_CACHE_SLOTS}"),
                );
            }
            let needed = preset.carved_mem();
            if needed > session {
                return invalid(
                    "presets",
                    format!("preset needs {needed} bytes, session region has {session}"),
                );
            }
        }
        Ok(())
    }

    /// Samples rendered per host frame, rounded up to 16.
    #[must_use]
    pub fn samples_per_frame(&self, preset: &SessionPreset) -> u32 {
        (preset.frequency / self.refresh_rate + 15) & !15
    }

    /// Sequencer ticks per host frame.
    #[must_use]
    pub fn updates_per_frame(&self, preset: &SessionPreset) -> u32 {
        self.samples_per_frame(preset) / 160 + 1
    }

    /// Sequencer ticks per second.
    #[must_use]
    pub fn ticks_per_second(&self, preset: &SessionPreset) -> u32 {
        self.updates_per_frame(preset) * self.refresh_rate
    }

    /// Tempo accumulator threshold: one tatum elapses each time a player's
    /// accumulated tempo crosses it.
    #[must_use]
    pub fn tempo_internal_to_external(&self, preset: &SessionPreset) -> u16 {
        let updates = self.updates_per_frame(preset) as f32;
        let value = updates * 2_880_000.0 / f32::from(self.tatums_per_beat) / self.tempo_divisor;
        // Saturating float-to-int cast.
        (value as u16).max(1)
    }

    /// Ticks to wait for in-flight transfers before a reset proceeds anyway.
    #[must_use]
    pub fn reset_drain_ticks(&self, preset: &SessionPreset) -> u32 {
        let ticks = u64::from(self.reset_drain_ms) * u64::from(self.ticks_per_second(preset)) / 1000;
        u32::try_from(ticks).unwrap_or(u32::MAX).max(1)
    }
}
