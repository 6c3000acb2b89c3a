//! # Session Reset
//!
//! Switching presets tears down and rebuilds every pool above the init
//! pool. Voices may still be reading sample memory and the device may still
//! be writing into the old pools, so the teardown is spread over ticks:
//!
//! ```text
//!  DisablePlayers ─▶ FadeReverb(4) ─▶ ReleaseVoices ─▶ Wait(16) ─▶ Mute
//!                                                                   │
//!           Idle ◀── Rebuild ◀── Drain (in_flight == 0 or bound) ◀──┘
//! ```
//!
//! [`SessionReset`] only decides what happens on each tick; the engine
//! carries the steps out.

use cadence_core::{ArenaPool, Block, ContentKind, ContentPool, Heap, PersistentPool, TemporaryPool};
use cadence_shared::SessionPreset;

use crate::error::{EngineError, EngineResult};
use crate::loader::SessionPools;

/// Ticks the reverb gain is lowered for.
pub const REVERB_FADE_TICKS: u8 = 4;

/// Ticks the released voices get to finish.
pub const RELEASE_WAIT_TICKS: u8 = 16;

/// Where a session reset is.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResetPhase {
    /// No reset running.
    #[default]
    Idle,
    /// Requested; players are disabled on the next tick.
    DisablePlayers,
    /// Lowering reverb gain, ticks left.
    FadeReverb(u8),
    /// Voices are released on the next tick.
    ReleaseVoices,
    /// Waiting for released voices, ticks left.
    Wait(u8),
    /// Output is muted on the next tick.
    Mute,
    /// Waiting for in-flight transfers, ticks spent.
    Drain(u32),
    /// Pools are rebuilt on the next tick.
    Rebuild,
}

/// What the engine must do this tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetStep {
    /// Nothing; no reset is running.
    Idle,
    /// Disable every player.
    DisablePlayers,
    /// Lower the reverb gain one notch.
    DecreaseReverb,
    /// Release every voice.
    ReleaseVoices,
    /// Keep waiting.
    Wait,
    /// Mute the output buffers.
    Mute,
    /// Transfers still in flight.
    Draining,
    /// Rebuild every pool for the preset.
    Rebuild(u8),
}

/// Cooperative reset state machine.
#[derive(Clone, Copy, Debug, Default)]
pub struct SessionReset {
    phase: ResetPhase,
    preset: u8,
    drain_bound: u32,
}

impl SessionReset {
    /// Current phase.
    #[inline]
    #[must_use]
    pub const fn phase(&self) -> ResetPhase {
        self.phase
    }

    /// Preset the running (or last) reset rebuilds for.
    #[inline]
    #[must_use]
    pub const fn preset(&self) -> u8 {
        self.preset
    }

    /// Returns true while a reset is running.
    #[inline]
    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.phase != ResetPhase::Idle
    }

    /// Starts a reset towards `preset`. Transfers are waited on for at most
    /// `drain_bound` ticks.
    ///
    /// # Errors
    ///
    /// [`EngineError::ResetInProgress`] if a reset is already running.
    pub fn begin(&mut self, preset: u8, drain_bound: u32) -> EngineResult<()> {
        if self.in_progress() {
            return Err(EngineError::ResetInProgress);
        }
        self.phase = ResetPhase::DisablePlayers;
        self.preset = preset;
        self.drain_bound = drain_bound.max(1);
        tracing::info!(preset, drain_bound = self.drain_bound, "session reset requested");
        Ok(())
    }

    /// Advances one tick given the transfers still in flight.
    pub fn step(&mut self, in_flight: usize) -> ResetStep {
        let (step, next) = match self.phase {
            ResetPhase::Idle => (ResetStep::Idle, ResetPhase::Idle),
            ResetPhase::DisablePlayers => (
                ResetStep::DisablePlayers,
                ResetPhase::FadeReverb(REVERB_FADE_TICKS),
            ),
            ResetPhase::FadeReverb(left) if left > 1 => {
                (ResetStep::DecreaseReverb, ResetPhase::FadeReverb(left - 1))
            }
            ResetPhase::FadeReverb(_) => (ResetStep::DecreaseReverb, ResetPhase::ReleaseVoices),
            ResetPhase::ReleaseVoices => {
                (ResetStep::ReleaseVoices, ResetPhase::Wait(RELEASE_WAIT_TICKS))
            }
            ResetPhase::Wait(left) if left > 1 => (ResetStep::Wait, ResetPhase::Wait(left - 1)),
            ResetPhase::Wait(_) => (ResetStep::Wait, ResetPhase::Mute),
            ResetPhase::Mute => (ResetStep::Mute, ResetPhase::Drain(0)),
            ResetPhase::Drain(spent) => {
                if in_flight == 0 {
                    (ResetStep::Draining, ResetPhase::Rebuild)
                } else if spent + 1 >= self.drain_bound {
                    tracing::warn!(
                        in_flight,
                        ticks = spent + 1,
                        "transfers still in flight after drain bound, rebuilding anyway"
                    );
                    (ResetStep::Draining, ResetPhase::Rebuild)
                } else {
                    (ResetStep::Draining, ResetPhase::Drain(spent + 1))
                }
            }
            ResetPhase::Rebuild => (ResetStep::Rebuild(self.preset), ResetPhase::Idle),
        };
        if next != self.phase {
            tracing::trace!(from = ?self.phase, to = ?next, "reset phase");
        }
        self.phase = next;
        step
    }
}

/// Carves the pools of one session out of `region`.
///
/// ```text
/// region: [ seq persistent | seq temporary | bank persistent | bank temporary | misc ... ]
/// ```
///
/// The misc arena takes what the content pools leave; the sample cache is
/// carved from it afterwards.
///
/// # Errors
///
/// [`EngineError::OutOfMemory`] if the preset does not fit the region.
pub fn carve_session(heap: &mut Heap, region: Block, preset: &SessionPreset) -> EngineResult<SessionPools> {
    let mut session = ArenaPool::new(region);
    let mut carve = |heap: &mut Heap, size: usize| {
        let remaining = session.remaining();
        carve_or_empty(&mut session, heap, size).ok_or(EngineError::OutOfMemory(
            cadence_core::MemoryError::OutOfMemory {
                requested: size,
                remaining,
            },
        ))
    };

    let seq_persistent = carve(heap, preset.persistent_seq_mem)?;
    let seq_temporary = carve(heap, preset.temporary_seq_mem)?;
    let bank_persistent = carve(heap, preset.persistent_bank_mem)?;
    let bank_temporary = carve(heap, preset.temporary_bank_mem)?;

    tracing::debug!(
        content = preset.content_mem(),
        misc = session.remaining(),
        "session pools carved"
    );

    Ok(SessionPools {
        misc: session,
        sequences: ContentPool::new(
            ContentKind::Sequence,
            PersistentPool::new(seq_persistent),
            TemporaryPool::new(seq_temporary),
        ),
        banks: ContentPool::new(
            ContentKind::Bank,
            PersistentPool::new(bank_persistent),
            TemporaryPool::new(bank_temporary),
        ),
    })
}

/// A zero-sized tier is an empty arena at the cursor, not a failure.
fn carve_or_empty(parent: &mut ArenaPool, heap: &mut Heap, size: usize) -> Option<ArenaPool> {
    if size == 0 {
        return Some(ArenaPool::new(Block::new(parent.cursor(), 0)));
    }
    parent.carve(heap, size)
}
