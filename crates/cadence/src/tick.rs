//! # Tick Loop
//!
//! Fixed-timestep driver for hosts without their own audio callback.
//!
//! ## Design
//!
//! The host refreshes at `refresh_rate` frames per second; each frame runs
//! `updates_per_frame` engine ticks back to back. The loop:
//! - Never allocates
//! - Catches up on missed frames instead of stretching time
//! - Sleeps most of the wait, then spins the last half millisecond

use std::time::{Duration, Instant};

use cadence_shared::{EngineConfig, SessionPreset};

use crate::engine::Engine;
use crate::synth::Synthesizer;
use crate::transfer::TransferDevice;

/// Fixed-timestep frame loop controller.
pub struct TickLoop {
    /// Target frame duration.
    frame_duration: Duration,
    /// Engine ticks per frame.
    ticks_per_frame: u32,
    /// Time of last poll.
    last_poll: Instant,
    /// Time owed since the last frame.
    accumulator: Duration,
    /// Frames executed.
    frame_count: u64,
    /// Frame timing statistics.
    stats: FrameStats,
}

/// Frame timing statistics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameStats {
    /// Shortest frame observed.
    pub min_frame_us: u64,
    /// Longest frame observed.
    pub max_frame_us: u64,
    /// Rolling average.
    pub avg_frame_us: u64,
    /// Frames that overran their budget.
    pub late_frames: u64,
    /// Frames measured.
    pub total_frames: u64,
}

impl FrameStats {
    fn fresh(frame_duration: Duration) -> Self {
        Self {
            min_frame_us: u64::MAX,
            max_frame_us: 0,
            avg_frame_us: micros(frame_duration),
            late_frames: 0,
            total_frames: 0,
        }
    }
}

impl TickLoop {
    /// Creates a loop at `frame_rate` frames per second running
    /// `ticks_per_frame` engine ticks per frame.
    #[must_use]
    pub fn new(frame_rate: u32, ticks_per_frame: u32) -> Self {
        let frame_duration = Duration::from_micros(1_000_000 / u64::from(frame_rate.max(1)));
        Self {
            frame_duration,
            ticks_per_frame: ticks_per_frame.max(1),
            last_poll: Instant::now(),
            accumulator: Duration::ZERO,
            frame_count: 0,
            stats: FrameStats::fresh(frame_duration),
        }
    }

    /// Creates a loop paced for `preset`.
    #[must_use]
    pub fn for_preset(config: &EngineConfig, preset: &SessionPreset) -> Self {
        Self::new(config.refresh_rate, config.updates_per_frame(preset))
    }

    /// Returns true if a frame is due.
    ///
    /// Call this in a loop until it returns false.
    #[must_use]
    pub fn should_run(&mut self) -> bool {
        let now = Instant::now();
        self.accumulator += now.duration_since(self.last_poll);
        self.last_poll = now;
        self.accumulator >= self.frame_duration
    }

    /// Runs one frame of engine ticks and records its timing.
    pub fn run_frame<D: TransferDevice, S: Synthesizer>(&mut self, engine: &mut Engine<D, S>) {
        self.accumulator = self.accumulator.saturating_sub(self.frame_duration);
        self.frame_count += 1;
        let start = Instant::now();
        for _ in 0..self.ticks_per_frame {
            engine.tick();
        }
        self.record(start.elapsed());
    }

    fn record(&mut self, duration: Duration) {
        let duration_us = micros(duration);
        self.stats.total_frames += 1;
        self.stats.min_frame_us = self.stats.min_frame_us.min(duration_us);
        self.stats.max_frame_us = self.stats.max_frame_us.max(duration_us);
        self.stats.avg_frame_us = (self.stats.avg_frame_us * 15 + duration_us) / 16;
        if duration > self.frame_duration {
            self.stats.late_frames += 1;
        }
    }

    /// Waits until the next frame is due.
    pub fn wait_for_next_frame(&self) {
        let elapsed = self.last_poll.elapsed() + self.accumulator;
        if elapsed >= self.frame_duration {
            return;
        }
        let remaining = self.frame_duration - elapsed;
        if remaining > Duration::from_micros(1000) {
            std::thread::sleep(remaining - Duration::from_micros(500));
        }
        while self.last_poll.elapsed() + self.accumulator < self.frame_duration {
            std::hint::spin_loop();
        }
    }

    /// Frames executed.
    #[inline]
    #[must_use]
    pub const fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Engine ticks per frame.
    #[inline]
    #[must_use]
    pub const fn ticks_per_frame(&self) -> u32 {
        self.ticks_per_frame
    }

    /// Frame timing statistics.
    #[inline]
    #[must_use]
    pub const fn stats(&self) -> &FrameStats {
        &self.stats
    }

    /// Target frame duration.
    #[inline]
    #[must_use]
    pub const fn frame_duration(&self) -> Duration {
        self.frame_duration
    }

    /// Resets statistics.
    pub fn reset_stats(&mut self) {
        self.stats = FrameStats::fresh(self.frame_duration);
    }
}

impl Default for TickLoop {
    fn default() -> Self {
        let config = EngineConfig::default();
        let preset = config.presets.first().cloned().unwrap_or_default();
        Self::for_preset(&config, &preset)
    }
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}
