//! # Control Path
//!
//! The engine runs on one thread. Host threads talk to it through two
//! objects:
//!
//! ```text
//!   host ── ControlHandle ──▶ [bounded channel] ──▶ Engine::tick (drained first)
//!   host ◀── StatusBoard ◀── publish at the end of every tick
//! ```
//!
//! Commands are fire-and-forget; their outcome shows up on the board.

use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use cadence_core::{ContentKind, LoadStatus};
use cadence_shared::constants::{MAX_BANKS, MAX_SEQUENCES};
use crossbeam_channel::{Sender, TrySendError};
use parking_lot::RwLock;

use crate::error::{EngineError, EngineResult};
use crate::sequencer::PlayerState;
use crate::session::ResetPhase;

/// Commands queued before the engine refuses more.
pub const CONTROL_QUEUE_DEPTH: usize = 64;

bitflags! {
    /// What a preload brings in.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PreloadMask: u8 {
        /// Every bank of the sequence's set.
        const BANKS = 0x01;
        /// The sequence itself.
        const SEQUENCE = 0x02;
    }
}

/// A request from the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    /// Rebuild the session for a preset.
    ResetSession {
        /// Preset index.
        preset: u8,
    },
    /// Load a sequence and start it on a player.
    LoadSequence {
        /// Player index.
        player: u8,
        /// Sequence id.
        seq: u8,
        /// Stream instead of blocking.
        streaming: bool,
    },
    /// Load content ahead of time.
    Preload {
        /// Sequence id.
        seq: u8,
        /// What to load.
        mask: PreloadMask,
    },
    /// Stop a player.
    DisablePlayer {
        /// Player index.
        player: u8,
    },
    /// Write a channel I/O port.
    SetChannelIo {
        /// Player index.
        player: u8,
        /// Channel index within the player.
        channel: u8,
        /// Port.
        port: u8,
        /// Value.
        value: i8,
    },
}

/// Cloneable sender half of the control channel.
#[derive(Clone, Debug)]
pub struct ControlHandle {
    sender: Sender<ControlCommand>,
}

impl ControlHandle {
    pub(crate) const fn new(sender: Sender<ControlCommand>) -> Self {
        Self { sender }
    }

    /// Queues `command` for the next tick.
    ///
    /// # Errors
    ///
    /// [`EngineError::Control`] when the queue is full or the engine is gone.
    pub fn send(&self, command: ControlCommand) -> EngineResult<()> {
        self.sender.try_send(command).map_err(|err| match err {
            TrySendError::Full(_) => EngineError::Control("control queue full"),
            TrySendError::Disconnected(_) => EngineError::Control("engine dropped"),
        })
    }

    /// Queues a session reset.
    ///
    /// # Errors
    ///
    /// As [`ControlHandle::send`].
    pub fn reset_session(&self, preset: u8) -> EngineResult<()> {
        self.send(ControlCommand::ResetSession { preset })
    }

    /// Queues a sequence load.
    ///
    /// # Errors
    ///
    /// As [`ControlHandle::send`].
    pub fn load_sequence(&self, player: u8, seq: u8, streaming: bool) -> EngineResult<()> {
        self.send(ControlCommand::LoadSequence {
            player,
            seq,
            streaming,
        })
    }
}

/// Everything the host can see of the engine.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineStatus {
    /// Ticks run so far.
    pub tick: u64,
    /// Active preset.
    pub preset: u8,
    /// Reset progress.
    pub reset: ResetPhase,
    /// Load status of every sequence id.
    pub sequences: Vec<LoadStatus>,
    /// Load status of every bank id.
    pub banks: Vec<LoadStatus>,
    /// One entry per player.
    pub players: Vec<Option<PlayerState>>,
    /// Streaming jobs not yet finished.
    pub pending_jobs: usize,
    /// Voices the synthesizer is playing.
    pub active_voices: usize,
    /// Sample cache hits.
    pub cache_hits: u64,
    /// Sample cache misses.
    pub cache_misses: u64,
}

impl EngineStatus {
    fn new(players: u8) -> Self {
        Self {
            tick: 0,
            preset: 0,
            reset: ResetPhase::Idle,
            sequences: vec![LoadStatus::NotLoaded; MAX_SEQUENCES],
            banks: vec![LoadStatus::NotLoaded; MAX_BANKS],
            players: vec![None; usize::from(players)],
            pending_jobs: 0,
            active_voices: 0,
            cache_hits: 0,
            cache_misses: 0,
        }
    }

    /// Load status of one id.
    #[must_use]
    pub fn load_status(&self, kind: ContentKind, id: u8) -> LoadStatus {
        let table = match kind {
            ContentKind::Sequence => &self.sequences,
            ContentKind::Bank => &self.banks,
        };
        table.get(usize::from(id)).copied().unwrap_or_default()
    }
}

/// Engine status shared with host threads.
///
/// Written once per tick under a short write lock. The vectors are sized
/// up front and overwritten in place.
pub struct StatusBoard {
    status: RwLock<EngineStatus>,
    generation: AtomicU64,
}

impl StatusBoard {
    pub(crate) fn new(players: u8) -> Self {
        Self {
            status: RwLock::new(EngineStatus::new(players)),
            generation: AtomicU64::new(0),
        }
    }

    /// Copy of the latest status.
    #[must_use]
    pub fn snapshot(&self) -> EngineStatus {
        self.status.read().clone()
    }

    /// Load status of one id as of the last tick.
    #[must_use]
    pub fn load_status(&self, kind: ContentKind, id: u8) -> LoadStatus {
        self.status.read().load_status(kind, id)
    }

    /// Reset progress as of the last tick.
    #[must_use]
    pub fn reset_phase(&self) -> ResetPhase {
        self.status.read().reset
    }

    /// Player state as of the last tick.
    #[must_use]
    pub fn player(&self, index: u8) -> Option<PlayerState> {
        self.status
            .read()
            .players
            .get(usize::from(index))
            .copied()
            .flatten()
    }

    /// Number of publishes so far.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn publish(&self, write: impl FnOnce(&mut EngineStatus)) {
        let mut status = self.status.write();
        write(&mut *status);
        drop(status);
        self.generation.fetch_add(1, Ordering::Release);
    }
}

impl std::fmt::Debug for StatusBoard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusBoard")
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_handle_reports_full_queue() {
        let (tx, rx) = bounded(1);
        let handle = ControlHandle::new(tx);
        handle.reset_session(0).unwrap();
        assert_eq!(
            handle.reset_session(1),
            Err(EngineError::Control("control queue full"))
        );
        assert_eq!(rx.try_recv(), Ok(ControlCommand::ResetSession { preset: 0 }));
        drop(rx);
        assert_eq!(
            handle.load_sequence(0, 1, false),
            Err(EngineError::Control("engine dropped"))
        );
    }

    #[test]
    fn test_board_publish_is_visible() {
        let board = StatusBoard::new(2);
        assert_eq!(board.load_status(ContentKind::Bank, 3), LoadStatus::NotLoaded);

        board.publish(|status| {
            status.tick = 7;
            status.banks[3] = LoadStatus::InProgress;
            status.reset = ResetPhase::Mute;
        });

        assert_eq!(board.generation(), 1);
        assert_eq!(board.load_status(ContentKind::Bank, 3), LoadStatus::InProgress);
        assert_eq!(board.reset_phase(), ResetPhase::Mute);
        assert_eq!(board.snapshot().tick, 7);
        assert_eq!(board.player(0), None);
        assert_eq!(board.player(9), None);
    }

    #[test]
    fn test_preload_mask_bits() {
        let mask = PreloadMask::BANKS | PreloadMask::SEQUENCE;
        assert!(mask.contains(PreloadMask::BANKS));
        assert_eq!(PreloadMask::from_bits_truncate(0xff), mask);
    }
}
