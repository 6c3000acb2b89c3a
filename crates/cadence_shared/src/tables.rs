//! # Tuning Tables
//!
//! Pitch and short-note lookup tables used by the sequencer. The standard
//! set is computed; a configuration file may supply its own.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Semitones covered by the note frequency table.
pub const NOTE_COUNT: usize = 128;

/// Entries in the pitch-bend scale table.
pub const PITCH_BEND_STEPS: usize = 256;

/// Entries in each short-note table.
pub const SHORT_TABLE_LEN: usize = 16;

/// Semitone whose frequency ratio is exactly 1.0.
pub const UNITY_NOTE: i32 = 39;

/// Default velocities for short-note encodings.
pub const DEFAULT_SHORT_VELOCITIES: [u8; SHORT_TABLE_LEN] = [
    12, 25, 38, 51, 57, 64, 71, 76, 83, 89, 96, 102, 109, 115, 121, 127,
];

/// Default durations for short-note encodings.
pub const DEFAULT_SHORT_DURATIONS: [u8; SHORT_TABLE_LEN] = [
    229, 203, 177, 162, 148, 135, 121, 107, 94, 80, 67, 54, 41, 27, 14, 0,
];

/// Frequency and short-note tables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TuningTables {
    /// Playback-rate ratio per semitone.
    pub note_frequencies: Vec<f32>,
    /// Frequency multiplier per pitch-bend step; index 128 is unity.
    pub pitch_bend_scale: Vec<f32>,
    /// Velocity per short-note velocity index.
    pub short_velocities: [u8; SHORT_TABLE_LEN],
    /// Duration per short-note duration index.
    pub short_durations: [u8; SHORT_TABLE_LEN],
}

impl Default for TuningTables {
    fn default() -> Self {
        Self::standard()
    }
}

impl TuningTables {
    /// Equal-tempered tables with [`UNITY_NOTE`] at ratio 1.0 and a pitch
    /// bend range of one octave either side.
    #[must_use]
    pub fn standard() -> Self {
        let note_frequencies = (0..NOTE_COUNT as i32)
            .map(|note| 2f32.powf((note - UNITY_NOTE) as f32 / 12.0))
            .collect();
        let pitch_bend_scale = (0..PITCH_BEND_STEPS as i32)
            .map(|step| 2f32.powf((step - 128) as f32 / 128.0))
            .collect();

        Self {
            note_frequencies,
            pitch_bend_scale,
            short_velocities: DEFAULT_SHORT_VELOCITIES,
            short_durations: DEFAULT_SHORT_DURATIONS,
        }
    }

    /// Frequency ratio of `semitone`; out-of-range notes read as silence.
    #[inline]
    #[must_use]
    pub fn note_frequency(&self, semitone: u8) -> f32 {
        self.note_frequencies
            .get(usize::from(semitone))
            .copied()
            .unwrap_or(0.0)
    }

    /// Pitch-bend multiplier at `step`, clamped into the table.
    #[inline]
    #[must_use]
    pub fn pitch_bend(&self, step: i32) -> f32 {
        let last = self.pitch_bend_scale.len().saturating_sub(1);
        let index = usize::try_from(step.max(0)).unwrap_or(0).min(last);
        self.pitch_bend_scale.get(index).copied().unwrap_or(1.0)
    }

    /// Checks table sizes.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidValue`] for a table of the wrong length.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.note_frequencies.len() != NOTE_COUNT {
            return Err(ConfigError::InvalidValue {
                field: "tuning.note_frequencies",
                reason: format!("expected {NOTE_COUNT} entries"),
            });
        }
        if self.pitch_bend_scale.len() != PITCH_BEND_STEPS {
            return Err(ConfigError::InvalidValue {
                field: "tuning.pitch_bend_scale",
                reason: format!("expected {PITCH_BEND_STEPS} entries"),
            });
        }
        Ok(())
    }
}
