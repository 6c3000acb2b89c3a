//! # Engine
//!
//! The facade a host drives. It owns the heap, the device, the synthesizer
//! and every subsystem, and runs them in a fixed order once per tick.
//!
//! ## Architecture
//!
//! ```text
//! heap: [ init pool (archive index) | session region ..................... ]
//!                                     │ rebuilt on every session reset
//!                                     ▼
//!                 [ seq P | seq T | bank P | bank T | misc (cache, samples) ]
//!
//! tick():
//!   1. drain control commands
//!   2. service the device, poll loader completions
//!   3. stop whatever evicted content was feeding
//!   4. age the sample cache
//!   5. run the sequencer (or advance a session reset)
//!   6. publish the status board
//! ```

use std::sync::Arc;

use cadence_core::{ArenaPool, Block, ContentKind, Heap, LoadStatus, MemoryError};
use cadence_shared::constants::MAX_CACHE_SLOTS;
use cadence_shared::EngineConfig;
use crossbeam_channel::{bounded, Receiver};

use crate::control::{
    ControlCommand, ControlHandle, PreloadMask, StatusBoard, CONTROL_QUEUE_DEPTH,
};
use crate::error::{EngineError, EngineResult};
use crate::loader::{ArchiveIndex, Loader};
use crate::sequencer::{PlayerBinding, PlayerState, Sequencer, SequencerContext};
use crate::session::{carve_session, ResetPhase, ResetStep, SessionReset, RELEASE_WAIT_TICKS};
use crate::synth::Synthesizer;
use crate::transfer::{
    CompletionQueue, DeviceAddr, SampleCache, SampleView, SlotClass, TransferDevice,
};

/// A running audio engine over device `D` and synthesizer `S`.
pub struct Engine<D: TransferDevice, S: Synthesizer> {
    config: EngineConfig,
    heap: Heap,
    session_region: Block,
    device: D,
    synth: S,
    loader: Loader,
    cache: SampleCache,
    cache_queue: CompletionQueue,
    sequencer: Sequencer,
    reset: SessionReset,
    preset: u8,
    ticks: u64,
    commands: Receiver<ControlCommand>,
    handle: ControlHandle,
    board: Arc<StatusBoard>,
}

impl<D: TransferDevice, S: Synthesizer> Engine<D, S> {
    /// Reserves the heap, reads the archive index and builds the session
    /// for preset 0.
    ///
    /// # Errors
    ///
    /// A rejected configuration, a failed heap reservation, a malformed
    /// archive or a preset that does not fit the heap.
    pub fn initialize(config: EngineConfig, mut device: D, mut synth: S) -> EngineResult<Self> {
        config.validate()?;

        let mut heap = Heap::new(config.heap_size).map_err(|err| {
            tracing::error!(%err, "audio heap unavailable");
            err
        })?;
        let mut root = ArenaPool::new(heap.whole());
        let mut init = root
            .carve(&mut heap, config.init_pool_size)
            .ok_or(MemoryError::OutOfMemory {
                requested: config.init_pool_size,
                remaining: root.remaining(),
            })?;
        let archive = ArchiveIndex::load(&mut heap, &mut init, &mut device)?;
        let session_region = Block::new(root.cursor(), heap.size() - root.cursor());

        let preset = config.preset(0).ok_or(EngineError::InvalidPreset(0))?;
        let mut pools = carve_session(&mut heap, session_region, preset)?;
        let cache_queue = CompletionQueue::new(MAX_CACHE_SLOTS);
        let mut cache = SampleCache::new();
        cache.rebuild(&mut heap, &mut pools.misc, preset, cache_queue.reply_to())?;
        synth.configure(preset);
        let sequencer = Sequencer::new(&config, config.tempo_internal_to_external(preset));
        let loader = Loader::new(archive, pools, config.players);

        let (sender, commands) = bounded(CONTROL_QUEUE_DEPTH);
        let board = Arc::new(StatusBoard::new(config.players));

        tracing::info!(
            heap = heap.size(),
            init = init.used(),
            session = session_region.len(),
            players = config.players,
            "engine initialised"
        );

        Ok(Self {
            config,
            heap,
            session_region,
            device,
            synth,
            loader,
            cache,
            cache_queue,
            sequencer,
            reset: SessionReset::default(),
            preset: 0,
            ticks: 0,
            commands,
            handle: ControlHandle::new(sender),
            board,
        })
    }

    /// Starts a session reset towards preset `preset`. The reset runs over
    /// the following ticks.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidPreset`] or [`EngineError::ResetInProgress`].
    pub fn reset_session(&mut self, preset: u8) -> EngineResult<()> {
        let target = self
            .config
            .preset(usize::from(preset))
            .ok_or(EngineError::InvalidPreset(preset))?;
        let bound = self.config.reset_drain_ticks(target);
        self.reset.begin(preset, bound)
    }

    /// Runs one engine tick.
    pub fn tick(&mut self) {
        self.drain_control();
        self.device.service(&mut self.heap);

        if self.reset.in_progress() {
            self.advance_reset();
        } else {
            self.loader.service(&mut self.heap, &mut self.device);
            self.apply_evictions();
            self.cache_queue.drain();
            self.cache.decay();
            let (sequencer, ctx) = self.split();
            sequencer.tick(ctx);
        }

        self.ticks += 1;
        self.publish();
    }

    /// Loads sequence `seq` and its banks, then starts it on `player`.
    ///
    /// With `streaming`, a single missing bank and the sequence body are
    /// streamed in over the next ticks and the player waits for them;
    /// otherwise everything is loaded before this returns.
    ///
    /// # Errors
    ///
    /// Unknown player or sequence, a reset in progress, a previous stream
    /// of the player still in flight, or any load failure. The player is
    /// left disabled on a load failure.
    pub fn load_sequence(&mut self, player: u8, seq: u8, streaming: bool) -> EngineResult<()> {
        if self.reset.in_progress() {
            return Err(EngineError::ResetInProgress);
        }
        if usize::from(player) >= self.sequencer.player_count() {
            return Err(EngineError::InvalidPlayer(player));
        }
        if usize::from(seq) >= self.loader.archive().sequence_count() {
            return Err(EngineError::MissingContent {
                what: "sequence",
                id: u32::from(seq),
            });
        }
        if self.loader.has_job(player) {
            tracing::warn!(player, seq, "previous stream of player still in flight");
            return Err(EngineError::LoadFailure {
                kind: ContentKind::Sequence,
                id: seq,
                reason: "player is still streaming",
            });
        }

        let (sequencer, ctx) = self.split();
        sequencer.disable_player(player, ctx)?;

        let bank_set = self
            .loader
            .bank_set(&self.heap, seq)
            .ok_or(EngineError::MissingContent {
                what: "bank set",
                id: u32::from(seq),
            })?;

        let default_bank = match self.loader.missing_banks(&bank_set) {
            (1, Some(bank)) if streaming => {
                if self.loader.status(ContentKind::Bank, bank) == LoadStatus::InProgress {
                    tracing::warn!(bank, seq, player, "bank is streaming for another player");
                    return Err(EngineError::LoadFailure {
                        kind: ContentKind::Bank,
                        id: bank,
                        reason: "bank already streaming",
                    });
                }
                self.loader
                    .load_bank_async(&mut self.heap, &mut self.device, bank, player)?;
                bank
            }
            _ => self
                .loader
                .load_banks_sync(&mut self.heap, &mut self.device, seq, &bank_set)?,
        };
        self.apply_evictions();

        let block = match self.loader.sequence_block(seq) {
            Some(block) => block,
            None if self.loader.status(ContentKind::Sequence, seq) == LoadStatus::InProgress => {
                tracing::warn!(seq, player, "sequence is streaming for another player");
                return Err(EngineError::LoadFailure {
                    kind: ContentKind::Sequence,
                    id: seq,
                    reason: "sequence already streaming",
                });
            }
            None if streaming => {
                self.loader
                    .load_sequence_async(&mut self.heap, &mut self.device, seq, player)?
            }
            None => self
                .loader
                .load_sequence_sync(&mut self.heap, &mut self.device, seq)?,
        };
        self.apply_evictions();

        let binding = PlayerBinding {
            seq_id: seq,
            seq: block,
            bank_set,
            default_bank,
        };
        let (sequencer, ctx) = self.split();
        sequencer.start_player(player, binding, ctx)
    }

    /// Loads the banks and/or the sequence of `seq` without starting it.
    ///
    /// # Errors
    ///
    /// A reset in progress or the first load failure.
    pub fn preload_sequence(&mut self, seq: u8, mask: PreloadMask) -> EngineResult<()> {
        if self.reset.in_progress() {
            return Err(EngineError::ResetInProgress);
        }
        let result = self.loader.preload(
            &mut self.heap,
            &mut self.device,
            seq,
            mask.contains(PreloadMask::BANKS),
            mask.contains(PreloadMask::SEQUENCE),
        );
        self.apply_evictions();
        result
    }

    /// Stops player `player`.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidPlayer`] for an unknown index.
    pub fn disable_player(&mut self, player: u8) -> EngineResult<()> {
        let (sequencer, ctx) = self.split();
        sequencer.disable_player(player, ctx)
    }

    /// Requests `size` bytes of sample data at device address `addr`
    /// through the sample cache.
    ///
    /// # Errors
    ///
    /// A reset in progress or a cache error.
    pub fn fetch_sample(
        &mut self,
        addr: DeviceAddr,
        size: usize,
        class: SlotClass,
    ) -> EngineResult<SampleView> {
        if self.reset.in_progress() {
            return Err(EngineError::ResetInProgress);
        }
        self.cache.request(&mut self.device, addr, size, class)
    }

    /// Bytes behind a sample view. Valid once its transfer has landed.
    #[must_use]
    pub fn sample_bytes(&self, view: &SampleView) -> &[u8] {
        self.heap.slice(view.block())
    }

    /// Writes I/O port `port` of a channel of `player`.
    ///
    /// # Errors
    ///
    /// Unknown player, channel or port.
    pub fn set_channel_io(&mut self, player: u8, channel: u8, port: u8, value: i8) -> EngineResult<()> {
        self.sequencer.set_channel_io(player, channel, port, value)
    }

    /// Current load status of one id.
    #[must_use]
    pub fn load_status(&self, kind: ContentKind, id: u8) -> LoadStatus {
        self.loader.status(kind, id)
    }

    /// Snapshot of one player.
    #[must_use]
    pub fn player_state(&self, player: u8) -> Option<PlayerState> {
        self.sequencer.player_state(player)
    }

    /// A sender for host threads.
    #[must_use]
    pub fn control_handle(&self) -> ControlHandle {
        self.handle.clone()
    }

    /// The status board host threads read.
    #[must_use]
    pub fn status_board(&self) -> Arc<StatusBoard> {
        Arc::clone(&self.board)
    }

    /// Reset progress.
    #[inline]
    #[must_use]
    pub const fn reset_phase(&self) -> ResetPhase {
        self.reset.phase()
    }

    /// Active preset index.
    #[inline]
    #[must_use]
    pub const fn preset(&self) -> u8 {
        self.preset
    }

    /// Ticks run so far.
    #[inline]
    #[must_use]
    pub const fn ticks(&self) -> u64 {
        self.ticks
    }

    /// The configuration the engine was started with.
    #[inline]
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The sequencer, for inspection.
    #[inline]
    #[must_use]
    pub const fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    /// The loader, for inspection.
    #[inline]
    #[must_use]
    pub const fn loader(&self) -> &Loader {
        &self.loader
    }

    /// The sample cache, for inspection.
    #[inline]
    #[must_use]
    pub const fn cache(&self) -> &SampleCache {
        &self.cache
    }

    /// The audio heap.
    #[inline]
    #[must_use]
    pub const fn heap(&self) -> &Heap {
        &self.heap
    }

    /// The transfer device.
    #[inline]
    #[must_use]
    pub const fn device(&self) -> &D {
        &self.device
    }

    /// The transfer device, mutably.
    #[inline]
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// The synthesizer.
    #[inline]
    #[must_use]
    pub const fn synth(&self) -> &S {
        &self.synth
    }

    /// The synthesizer, mutably.
    #[inline]
    pub fn synth_mut(&mut self) -> &mut S {
        &mut self.synth
    }

    fn split(&mut self) -> (&mut Sequencer, SequencerContext<'_>) {
        (
            &mut self.sequencer,
            SequencerContext {
                heap: &mut self.heap,
                loader: &mut self.loader,
                synth: &mut self.synth,
            },
        )
    }

    fn drain_control(&mut self) {
        for _ in 0..CONTROL_QUEUE_DEPTH {
            let Ok(command) = self.commands.try_recv() else {
                break;
            };
            if let Err(err) = self.execute(command) {
                tracing::warn!(?command, %err, "control command failed");
            }
        }
    }

    fn execute(&mut self, command: ControlCommand) -> EngineResult<()> {
        match command {
            ControlCommand::ResetSession { preset } => self.reset_session(preset),
            ControlCommand::LoadSequence {
                player,
                seq,
                streaming,
            } => self.load_sequence(player, seq, streaming),
            ControlCommand::Preload { seq, mask } => self.preload_sequence(seq, mask),
            ControlCommand::DisablePlayer { player } => self.disable_player(player),
            ControlCommand::SetChannelIo {
                player,
                channel,
                port,
                value,
            } => self.set_channel_io(player, channel, port, value),
        }
    }

    fn apply_evictions(&mut self) {
        while let Some(eviction) = self.loader.pop_eviction() {
            tracing::debug!(kind = ?eviction.kind, id = eviction.id, "content evicted");
            let (sequencer, ctx) = self.split();
            sequencer.apply_eviction(eviction, ctx);
        }
    }

    fn advance_reset(&mut self) {
        match self.reset.step(self.device.in_flight()) {
            ResetStep::Idle | ResetStep::Wait | ResetStep::Draining => {}
            ResetStep::DisablePlayers => {
                let (sequencer, ctx) = self.split();
                sequencer.disable_all(ctx);
            }
            ResetStep::DecreaseReverb => self.synth.decrease_reverb_gain(),
            ResetStep::ReleaseVoices => self.synth.fade_out(u16::from(RELEASE_WAIT_TICKS)),
            ResetStep::Mute => self.synth.mute(),
            ResetStep::Rebuild(preset) => {
                if let Err(err) = self.rebuild(preset) {
                    tracing::error!(preset, %err, "session rebuild failed");
                }
            }
        }
    }

    fn rebuild(&mut self, index: u8) -> EngineResult<()> {
        let preset = self
            .config
            .preset(usize::from(index))
            .ok_or(EngineError::InvalidPreset(index))?;

        self.sequencer.clear();
        let stale = self.cache_queue.drain();
        // Carving zero-fills the region, so a failure past this point
        // leaves nothing the old loader or cache entries point at.
        let pools = carve_session(&mut self.heap, self.session_region, preset).and_then(|mut pools| {
            self.cache
                .rebuild(&mut self.heap, &mut pools.misc, preset, self.cache_queue.reply_to())?;
            Ok(pools)
        });
        let pools = match pools {
            Ok(pools) => pools,
            Err(err) => {
                self.loader.forget();
                self.cache.clear();
                return Err(err);
            }
        };
        self.loader.install(pools);
        self.synth.configure(preset);
        self.sequencer
            .set_tempo_internal(self.config.tempo_internal_to_external(preset));
        self.preset = index;

        tracing::info!(
            preset = index,
            stale,
            cache_slots = self.cache.slot_count(),
            "session rebuilt"
        );
        Ok(())
    }

    fn publish(&self) {
        let Self {
            board,
            loader,
            sequencer,
            synth,
            cache,
            reset,
            ticks,
            preset,
            ..
        } = self;
        board.publish(|status| {
            status.tick = *ticks;
            status.preset = *preset;
            status.reset = reset.phase();
            status
                .sequences
                .copy_from_slice(loader.statuses(ContentKind::Sequence).as_slice());
            status
                .banks
                .copy_from_slice(loader.statuses(ContentKind::Bank).as_slice());
            for (index, slot) in status.players.iter_mut().enumerate() {
                *slot = u8::try_from(index)
                    .ok()
                    .and_then(|index| sequencer.player_state(index));
            }
            status.pending_jobs = loader.pending_jobs();
            status.active_voices = synth.active_voices();
            status.cache_hits = cache.hits();
            status.cache_misses = cache.misses();
        });
    }
}

impl<D: TransferDevice, S: Synthesizer> std::fmt::Debug for Engine<D, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("preset", &self.preset)
            .field("ticks", &self.ticks)
            .field("reset", &self.reset.phase())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{ArchiveBuilder, BankBuilder};
    use crate::synth::VoiceRecorder;
    use crate::transfer::RomDevice;
    use cadence_shared::{ConfigError, SessionPreset};

    fn small_config() -> EngineConfig {
        EngineConfig {
            heap_size: 0x20000,
            init_pool_size: 0x1000,
            players: 2,
            channels: 16,
            layers: 16,
            presets: vec![SessionPreset {
                max_voices: 4,
                persistent_seq_mem: 0x800,
                temporary_seq_mem: 0x800,
                persistent_bank_mem: 0x1000,
                temporary_bank_mem: 0x2000,
                ..SessionPreset::default()
            }],
            ..EngineConfig::default()
        }
    }

    fn archive() -> ArchiveBuilder {
        let mut archive = ArchiveBuilder::new();
        let bank = archive.add_bank(BankBuilder::new().sample(&[0; 64]).instrument(0, 1.0));
        archive.add_sequence(&[0xfd, 100, 0xff], &[bank]);
        archive
    }

    #[test]
    fn test_initialize_rejects_bad_config() {
        let config = EngineConfig {
            players: 0,
            ..small_config()
        };
        let result = Engine::initialize(config, RomDevice::new(archive().build(), 0), VoiceRecorder::new(4));
        assert!(matches!(
            result,
            Err(EngineError::Config(ConfigError::InvalidValue { field: "players", .. }))
        ));
    }

    #[test]
    fn test_initialize_rejects_bad_archive() {
        let result = Engine::initialize(small_config(), RomDevice::new(vec![0; 256], 0), VoiceRecorder::new(4));
        assert!(matches!(result, Err(EngineError::InvalidArchive(_))));
    }

    #[test]
    fn test_tick_publishes_status() {
        let mut engine =
            Engine::initialize(small_config(), RomDevice::new(archive().build(), 0), VoiceRecorder::new(4))
                .unwrap();
        let board = engine.status_board();
        engine.load_sequence(0, 0, false).unwrap();
        engine.tick();

        assert_eq!(engine.ticks(), 1);
        assert_eq!(board.snapshot().tick, 1);
        assert_eq!(board.load_status(ContentKind::Sequence, 0), LoadStatus::Complete);
        assert_eq!(board.load_status(ContentKind::Bank, 0), LoadStatus::Complete);
    }

    #[test]
    fn test_control_commands_run_at_tick_start() {
        let mut engine =
            Engine::initialize(small_config(), RomDevice::new(archive().build(), 0), VoiceRecorder::new(4))
                .unwrap();
        let handle = engine.control_handle();
        handle.load_sequence(1, 0, false).unwrap();
        assert_eq!(engine.load_status(ContentKind::Sequence, 0), LoadStatus::NotLoaded);

        engine.tick();
        assert!(engine.load_status(ContentKind::Sequence, 0).is_loaded());
    }

    #[test]
    fn test_failed_rebuild_forgets_loaded_content() {
        let mut engine =
            Engine::initialize(small_config(), RomDevice::new(archive().build(), 0), VoiceRecorder::new(4))
                .unwrap();
        engine.load_sequence(0, 0, false).unwrap();
        assert_eq!(engine.load_status(ContentKind::Bank, 0), LoadStatus::Complete);

        // The content pools still carve, but no short-lived cache slot fits.
        engine.config.presets[0].short_slot_size = engine.config.heap_size;
        assert!(matches!(engine.rebuild(0), Err(EngineError::OutOfMemory(_))));

        assert_eq!(engine.load_status(ContentKind::Sequence, 0), LoadStatus::NotLoaded);
        assert_eq!(engine.load_status(ContentKind::Bank, 0), LoadStatus::NotLoaded);
        assert!(engine.loader.pool(ContentKind::Sequence).persistent().entries().is_empty());
        assert!(engine.loader.pool(ContentKind::Bank).persistent().entries().is_empty());
        assert_eq!(engine.cache.slot_count(), 0);
        assert!(matches!(
            engine.fetch_sample(0x100, 4, SlotClass::ShortLived),
            Err(EngineError::CacheExhausted { .. })
        ));

        // Content is transferred again rather than read from zeroed bytes.
        let copies = engine.device().blocking_copies();
        engine.load_sequence(0, 0, false).unwrap();
        assert!(engine.device().blocking_copies() > copies);
        assert_eq!(engine.load_status(ContentKind::Bank, 0), LoadStatus::Complete);
        assert!(engine.player_state(0).unwrap().enabled);
    }

    #[test]
    fn test_unknown_player_and_preset() {
        let mut engine =
            Engine::initialize(small_config(), RomDevice::new(archive().build(), 0), VoiceRecorder::new(4))
                .unwrap();
        assert_eq!(engine.load_sequence(5, 0, false), Err(EngineError::InvalidPlayer(5)));
        assert_eq!(engine.reset_session(3), Err(EngineError::InvalidPreset(3)));
        assert_eq!(
            engine.load_sequence(0, 9, false),
            Err(EngineError::MissingContent {
                what: "sequence",
                id: 9
            })
        );
    }
}
