//! # Sequence Virtual Machine
//!
//! Three levels of bytecode interpreters driving the synthesizer.
//!
//! ## Architecture
//!
//! ```text
//!  Player (tempo, fades, channel masks)          one per player slot
//!    │ 16 channel handles
//!    ▼
//!  Channel (instrument, volume, pan, vibrato)    SlotPool<Channel>
//!    │ 4 layer handles
//!    ▼
//!  Layer (notes, durations, portamento)          SlotPool<Layer>
//!    │ allocate / update / release
//!    ▼
//!  Synthesizer
//! ```
//!
//! Each level keeps its own program counter, a four-frame call/loop
//! stack and a delay counter. Channels and layers come from fixed pools
//! and are referenced by handle, so disabling a player walks its handles
//! and returns every unit to its pool in the same tick.
//!
//! A script fault (stack overflow or underflow, a program counter or
//! data offset outside the sequence, or running out of the per-tick
//! instruction budget without yielding) is logged and disables the unit
//! that hit it. Nothing above it is affected.

mod channel;
mod layer;
pub mod opcodes;
mod playback;
mod player;
mod script;

pub use channel::{Channel, Instrument};
pub use layer::{Layer, Portamento};
pub use playback::{VibratoSettings, VoiceParams};
pub use player::{FadeState, MuteBehavior, Player, PlayerState, ShortTable};
pub use script::ScriptState;

use cadence_core::{Block, ContentKind, Heap, SlotPool};
use cadence_shared::constants::CHANNEL_IO_PORTS;
use cadence_shared::{BankSet, EngineConfig, TuningTables};
use thiserror::Error;

use crate::error::{EngineError, EngineResult};
use crate::loader::{Eviction, Loader};
use crate::synth::Synthesizer;

/// Faults raised while interpreting bytecode.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptError {
    /// A call or loop needed a fifth stack frame.
    #[error("call stack overflow at pc {pc:#x}")]
    StackOverflow {
        /// Program counter at the fault.
        pc: usize,
    },

    /// A loop end or break found no frame.
    #[error("call stack underflow at pc {pc:#x}")]
    StackUnderflow {
        /// Program counter at the fault.
        pc: usize,
    },

    /// The program counter left the sequence.
    #[error("program counter {pc:#x} outside sequence")]
    PcOutOfBounds {
        /// Offending program counter.
        pc: usize,
    },

    /// A data read or write left the sequence.
    #[error("data offset {offset:#x} outside sequence")]
    DataOutOfBounds {
        /// Offending offset.
        offset: usize,
    },

    /// The script ran its whole per-tick budget without yielding.
    #[error("no yield within the instruction budget at pc {pc:#x}")]
    Runaway {
        /// Program counter when the budget ran out.
        pc: usize,
    },
}

/// What a script asked for when it stopped reading instructions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Flow {
    /// Done for this tick.
    Yield,
    /// The script ended at its top level.
    Finish,
}

/// Returns true if branch instruction `cmd` is taken for `value`.
fn branch_taken(cmd: u8, value: i32) -> bool {
    match cmd {
        opcodes::BEQZ | opcodes::BEQZ_REL => value == 0,
        opcodes::BLTZ | opcodes::BLTZ_REL => value < 0,
        opcodes::BGEZ => value >= 0,
        _ => true,
    }
}

/// Content a player is started on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlayerBinding {
    /// Sequence id.
    pub seq_id: u8,
    /// Sequence bytes in the heap.
    pub seq: Block,
    /// Banks the sequence may select.
    pub bank_set: BankSet,
    /// Bank channels start on.
    pub default_bank: u8,
}

/// Engine state the sequencer borrows for one call.
pub struct SequencerContext<'a> {
    /// The audio heap.
    pub heap: &'a mut Heap,
    /// Load status and bank lookup.
    pub loader: &'a mut Loader,
    /// Voice output.
    pub synth: &'a mut dyn Synthesizer,
}

/// Shared state every interpreter level reads.
pub(crate) struct Env<'a> {
    heap: &'a mut Heap,
    loader: &'a mut Loader,
    synth: &'a mut dyn Synthesizer,
    tables: &'a TuningTables,
    tempo_internal: u16,
}

/// The unit pools plus [`Env`]; interpreter methods live on this.
pub(crate) struct Machine<'a> {
    env: Env<'a>,
    channels: &'a mut SlotPool<Channel>,
    layers: &'a mut SlotPool<Layer>,
}

/// All sequence players and the pools their units come from.
pub struct Sequencer {
    players: Vec<Player>,
    channels: SlotPool<Channel>,
    layers: SlotPool<Layer>,
    tables: TuningTables,
    tempo_internal: u16,
}

impl Sequencer {
    /// Creates idle players and empty unit pools sized by `config`.
    #[must_use]
    pub fn new(config: &EngineConfig, tempo_internal: u16) -> Self {
        Self {
            players: (0..config.players).map(Player::new).collect(),
            channels: SlotPool::new(config.channels),
            layers: SlotPool::new(config.layers),
            tables: config.tuning.clone().unwrap_or_default(),
            tempo_internal: tempo_internal.max(1),
        }
    }

    /// Tempo accumulator threshold for one tatum.
    #[inline]
    #[must_use]
    pub const fn tempo_internal(&self) -> u16 {
        self.tempo_internal
    }

    /// Changes the tatum threshold (after a session rebuild).
    pub fn set_tempo_internal(&mut self, tempo_internal: u16) {
        self.tempo_internal = tempo_internal.max(1);
    }

    /// Number of player slots.
    #[inline]
    #[must_use]
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Player `index`.
    #[must_use]
    pub fn player(&self, index: u8) -> Option<&Player> {
        self.players.get(usize::from(index))
    }

    /// Snapshot of player `index`.
    #[must_use]
    pub fn player_state(&self, index: u8) -> Option<PlayerState> {
        let player = self.player(index)?;
        Some(player.state(&self.channels))
    }

    /// Channel `channel` of player `player`.
    #[must_use]
    pub fn channel(&self, player: u8, channel: u8) -> Option<&Channel> {
        let handle = self.player(player)?.channel_handle(channel)?;
        self.channels.get(handle)
    }

    /// Layer `layer` of channel `channel` of player `player`.
    #[must_use]
    pub fn layer(&self, player: u8, channel: u8, layer: u8) -> Option<&Layer> {
        let handle = self.channel(player, channel)?.layer_handle(layer)?;
        self.layers.get(handle)
    }

    /// Channels currently allocated to players.
    #[inline]
    #[must_use]
    pub fn active_channels(&self) -> usize {
        self.channels.allocated_count()
    }

    /// Layers currently allocated to channels.
    #[inline]
    #[must_use]
    pub fn active_layers(&self) -> usize {
        self.layers.allocated_count()
    }

    /// Returns true if any player is enabled.
    #[must_use]
    pub fn any_enabled(&self) -> bool {
        self.players.iter().any(Player::is_enabled)
    }

    /// Tuning tables in use.
    #[inline]
    #[must_use]
    pub const fn tables(&self) -> &TuningTables {
        &self.tables
    }

    /// Disables player `index` and starts it on `binding`.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidPlayer`] for an unknown index.
    pub fn start_player(
        &mut self,
        index: u8,
        binding: PlayerBinding,
        ctx: SequencerContext<'_>,
    ) -> EngineResult<()> {
        let (players, mut machine) = self.split(ctx);
        let player = players
            .get_mut(usize::from(index))
            .ok_or(EngineError::InvalidPlayer(index))?;
        machine.disable_player(player);
        player.start(binding);
        tracing::debug!(
            player = index,
            seq = binding.seq_id,
            bank = binding.default_bank,
            "player started"
        );
        Ok(())
    }

    /// Disables player `index`, its channels and layers.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidPlayer`] for an unknown index.
    pub fn disable_player(&mut self, index: u8, ctx: SequencerContext<'_>) -> EngineResult<()> {
        let (players, mut machine) = self.split(ctx);
        let player = players
            .get_mut(usize::from(index))
            .ok_or(EngineError::InvalidPlayer(index))?;
        machine.disable_player(player);
        Ok(())
    }

    /// Disables every player.
    pub fn disable_all(&mut self, ctx: SequencerContext<'_>) {
        let (players, mut machine) = self.split(ctx);
        for player in players.iter_mut() {
            machine.disable_player(player);
        }
    }

    /// Disables every enabled player running sequence `seq`.
    pub fn discard_sequence(&mut self, seq: u8, ctx: SequencerContext<'_>) {
        let (players, mut machine) = self.split(ctx);
        for player in players
            .iter_mut()
            .filter(|player| player.is_enabled() && player.seq_id() == seq)
        {
            tracing::debug!(player = player.index(), seq, "sequence discarded under player");
            machine.disable_player(player);
        }
    }

    /// Kills every voice playing from bank `bank` and disables its layer.
    pub fn discard_bank(&mut self, bank: u8, synth: &mut dyn Synthesizer) {
        let mut killed = 0usize;
        for (_, layer) in self.layers.iter_mut() {
            if let Some(voice) = layer.take_voice_from_bank(bank) {
                synth.kill_voice(voice);
                layer.disable_silently();
                killed += 1;
            }
        }
        if killed > 0 {
            tracing::debug!(bank, killed, "voices killed for discarded bank");
        }
    }

    /// Stops whatever still uses evicted content.
    pub fn apply_eviction(&mut self, eviction: Eviction, ctx: SequencerContext<'_>) {
        match eviction.kind {
            ContentKind::Sequence => self.discard_sequence(eviction.id, ctx),
            ContentKind::Bank => self.discard_bank(eviction.id, ctx.synth),
        }
    }

    /// Writes I/O port `port` of a player's channel.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidPlayer`] or [`EngineError::MissingContent`]
    /// for an unknown player, unallocated channel or port.
    pub fn set_channel_io(&mut self, player: u8, channel: u8, port: u8, value: i8) -> EngineResult<()> {
        let handle = self
            .players
            .get(usize::from(player))
            .ok_or(EngineError::InvalidPlayer(player))?
            .channel_handle(channel)
            .ok_or(EngineError::MissingContent {
                what: "channel",
                id: u32::from(channel),
            })?;
        if usize::from(port) >= CHANNEL_IO_PORTS {
            return Err(EngineError::MissingContent {
                what: "io port",
                id: u32::from(port),
            });
        }
        if let Some(channel) = self.channels.get_mut(handle) {
            channel.set_io(port, value);
        }
        Ok(())
    }

    /// Runs one tick: scripts of every enabled player, fades, then voice
    /// parameter updates.
    pub fn tick(&mut self, ctx: SequencerContext<'_>) {
        let (players, mut machine) = self.split(ctx);
        for player in players.iter_mut() {
            if !player.is_enabled() {
                continue;
            }
            machine.run_player(player);
            if player.is_enabled() && player.fade.step() {
                tracing::debug!(player = player.index(), "fade-out finished");
                machine.disable_player(player);
            }
            if player.is_enabled() {
                machine.publish(player);
            }
        }
    }

    /// Returns every unit to its pool without touching voices or content.
    ///
    /// Used after a session rebuild, when voices and pools are gone anyway.
    pub fn clear(&mut self) {
        self.channels.clear();
        self.layers.clear();
        for player in &mut self.players {
            *player = Player::new(player.index());
        }
    }

    fn split<'a, 'b: 'a>(&'a mut self, ctx: SequencerContext<'b>) -> (&'a mut [Player], Machine<'a>) {
        let Self {
            players,
            channels,
            layers,
            tables,
            tempo_internal,
        } = self;
        let machine = Machine {
            env: Env {
                heap: ctx.heap,
                loader: ctx.loader,
                synth: ctx.synth,
                tables,
                tempo_internal: *tempo_internal,
            },
            channels,
            layers,
        };
        (players.as_mut_slice(), machine)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::builder::{ArchiveBuilder, BankBuilder};
    use crate::loader::{ArchiveIndex, SessionPools};
    use crate::synth::{SynthEvent, VoiceRecorder, VoiceSource};
    use crate::transfer::RomDevice;
    use cadence_core::{ArenaPool, ContentPool, LoadStatus, PersistentPool, TemporaryPool};

    /// A loaded sequence plus everything needed to tick it.
    pub(crate) struct Rig {
        pub heap: Heap,
        #[allow(dead_code)]
        pub rom: RomDevice,
        pub loader: Loader,
        pub synth: VoiceRecorder,
        pub sequencer: Sequencer,
    }

    impl Rig {
        /// Builds an archive with `bank` and `script` as sequence 0 and
        /// starts player 0 on it. The tatum threshold equals the default
        /// tempo, so every tick is a tatum.
        pub(crate) fn new(bank: BankBuilder, script: &[u8]) -> Self {
            let mut archive = ArchiveBuilder::new();
            archive.add_bank(bank);
            archive.add_sequence(script, &[0]);

            let mut heap = Heap::new(0x20000).unwrap();
            let mut root = ArenaPool::new(heap.whole());
            let mut init = root.carve(&mut heap, 0x800).unwrap();
            let mut rom = RomDevice::new(archive.build(), 0);
            let index = ArchiveIndex::load(&mut heap, &mut init, &mut rom).unwrap();
            let misc = root.carve(&mut heap, 0x1000).unwrap();
            let seq = root.carve(&mut heap, 0x2000).unwrap();
            let bank = root.carve(&mut heap, 0x4000).unwrap();
            let pools = SessionPools {
                misc,
                sequences: ContentPool::new(
                    ContentKind::Sequence,
                    PersistentPool::new(seq),
                    TemporaryPool::new(ArenaPool::new(Block::new(seq.end(), 0))),
                ),
                banks: ContentPool::new(
                    ContentKind::Bank,
                    PersistentPool::new(bank),
                    TemporaryPool::new(ArenaPool::new(Block::new(bank.end(), 0))),
                ),
            };
            let mut loader = Loader::new(index, pools, 2);
            loader.load_bank_sync(&mut heap, &mut rom, 0).unwrap();
            let block = loader.load_sequence_sync(&mut heap, &mut rom, 0).unwrap();

            let config = EngineConfig {
                players: 2,
                channels: 16,
                layers: 16,
                ..EngineConfig::default()
            };
            let mut rig = Self {
                heap,
                rom,
                loader,
                synth: VoiceRecorder::new(8),
                sequencer: Sequencer::new(&config, 120 * 48),
            };
            let binding = PlayerBinding {
                seq_id: 0,
                seq: block,
                bank_set: BankSet::from_banks(&[0]),
                default_bank: 0,
            };
            let (sequencer, ctx) = rig.ctx_parts();
            sequencer.start_player(0, binding, ctx).unwrap();
            rig
        }

        pub(crate) fn ctx_parts(&mut self) -> (&mut Sequencer, SequencerContext<'_>) {
            (
                &mut self.sequencer,
                SequencerContext {
                    heap: &mut self.heap,
                    loader: &mut self.loader,
                    synth: &mut self.synth,
                },
            )
        }

        pub(crate) fn tick(&mut self, count: usize) {
            for _ in 0..count {
                let ctx = SequencerContext {
                    heap: &mut self.heap,
                    loader: &mut self.loader,
                    synth: &mut self.synth,
                };
                self.sequencer.tick(ctx);
            }
        }

        pub(crate) fn player(&self) -> &Player {
            self.sequencer.player(0).unwrap()
        }
    }

    /// Sequence prefix: init channel 0, start it at `channel_at`.
    pub(crate) fn player_prelude(channel_at: u16) -> Vec<u8> {
        let [hi, lo] = channel_at.to_be_bytes();
        vec![0xd7, 0x00, 0x01, 0x90, hi, lo]
    }

    pub(crate) fn one_instrument() -> BankBuilder {
        BankBuilder::new().sample(&[0; 32]).instrument(0, 1.0)
    }

    #[test]
    fn test_player_disable_cascades() {
        // 0: init + start channel at 8, 6: delay 100
        let mut script = player_prelude(8);
        script.extend_from_slice(&[0xfd, 100]);
        // 8: channel: instrument 0, layer 0 at 16, then wait
        script.extend_from_slice(&[0xc1, 0x00, 0x90, 0x00, 16, 0xfd, 0x7f, 0xff]);
        // 16: layer: short note 39 with default play percentage
        script.extend_from_slice(&[0x40 + 39, 0xff]);
        let mut rig = Rig::new(one_instrument(), &script);

        rig.tick(1);
        assert_eq!(rig.sequencer.active_channels(), 1);
        assert_eq!(rig.sequencer.active_layers(), 1);
        assert_eq!(rig.synth.active_voices(), 1);

        let (sequencer, ctx) = rig_ctx(&mut rig);
        sequencer.disable_player(0, ctx).unwrap();
        assert!(!rig.player().is_enabled());
        assert_eq!(rig.sequencer.active_channels(), 0);
        assert_eq!(rig.sequencer.active_layers(), 0);
        assert_eq!(rig.synth.active_voices(), 0);
        assert_eq!(rig.loader.status(ContentKind::Sequence, 0), LoadStatus::Discardable);
        assert_eq!(rig.loader.status(ContentKind::Bank, 0), LoadStatus::Discardable);
    }

    fn rig_ctx(rig: &mut Rig) -> (&mut Sequencer, SequencerContext<'_>) {
        rig.ctx_parts()
    }

    #[test]
    fn test_player_end_disables() {
        let mut rig = Rig::new(one_instrument(), &[0xff]);
        assert!(rig.player().is_enabled());
        rig.tick(1);
        assert!(!rig.player().is_enabled());
        assert!(rig.player().is_finished());
    }

    #[test]
    fn test_call_overflow_disables_only_that_player() {
        // call 0 forever: fifth frame overflows
        let mut rig = Rig::new(one_instrument(), &[0xfc, 0x00, 0x00]);
        rig.tick(1);
        assert!(!rig.player().is_enabled());
        assert!(!rig.sequencer.any_enabled());
    }

    #[test]
    fn test_discard_bank_kills_voices() {
        let mut script = player_prelude(8);
        script.extend_from_slice(&[0xfd, 100]);
        script.extend_from_slice(&[0xc1, 0x00, 0x90, 0x00, 16, 0xfd, 0x7f, 0xff]);
        script.extend_from_slice(&[0x40 + 39, 0xff]);
        let mut rig = Rig::new(one_instrument(), &script);
        rig.tick(1);
        let voice = rig.synth.live_voices().next().unwrap();

        rig.sequencer.discard_bank(0, &mut rig.synth);
        assert_eq!(rig.synth.active_voices(), 0);
        assert!(rig.synth.events().contains(&SynthEvent::Killed(voice)));
        let layer = rig.sequencer.layer(0, 0, 0).unwrap();
        assert!(!layer.is_enabled());
        assert!(layer.is_finished());
        assert!(matches!(
            rig.synth.allocations().next().unwrap().source,
            VoiceSource::Sample { bank: 0, .. }
        ));
    }

    #[test]
    fn test_channel_io_from_host() {
        let mut script = player_prelude(8);
        script.extend_from_slice(&[0xfd, 100]);
        script.extend_from_slice(&[0xfd, 0x7f, 0xff]);
        let mut rig = Rig::new(one_instrument(), &script);
        rig.tick(1);

        rig.sequencer.set_channel_io(0, 0, 5, 42).unwrap();
        assert_eq!(rig.sequencer.channel(0, 0).unwrap().io(5), 42);
        assert!(rig.sequencer.set_channel_io(0, 3, 0, 1).is_err());
        assert!(rig.sequencer.set_channel_io(0, 0, 8, 1).is_err());
        assert_eq!(
            rig.sequencer.set_channel_io(9, 0, 0, 1),
            Err(EngineError::InvalidPlayer(9))
        );
    }

    #[test]
    fn test_branch_conditions() {
        assert!(branch_taken(opcodes::JUMP, 5));
        assert!(branch_taken(opcodes::BEQZ, 0));
        assert!(!branch_taken(opcodes::BEQZ_REL, 1));
        assert!(branch_taken(opcodes::BLTZ, -1));
        assert!(!branch_taken(opcodes::BGEZ, -1));
    }
}
