//! Sequence players: the top interpreter level.
//!
//! A player owns tempo, transposition, fades and up to sixteen channel
//! handles. Its script runs once per tatum; channels run every tatum
//! whether or not the player script was delayed.

use bitflags::bitflags;
use cadence_core::{Block, ContentKind, SlotHandle, SlotPool};
use cadence_shared::constants::{
    CHANNELS_PER_PLAYER, DEFAULT_TEMPO_BPM, SCRIPT_INSTRUCTIONS_PER_TICK, TATUMS_PER_BEAT,
};
use cadence_shared::BankSet;

use super::opcodes::{self, player as op};
use super::{branch_taken, Channel, Flow, Machine, PlayerBinding, ScriptError, ScriptState};
use crate::synth::VoiceOwner;

bitflags! {
    /// What muting a player stops.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MuteBehavior: u8 {
        /// Scale voice velocity by the mute scale.
        const SOFTEN = 0x20;
        /// Start no new notes.
        const STOP_NOTES = 0x40;
        /// Stop running scripts.
        const STOP_SCRIPT = 0x80;
    }
}

impl Default for MuteBehavior {
    fn default() -> Self {
        Self::all()
    }
}

/// Where short-note velocities or durations come from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ShortTable {
    /// The tuning tables.
    #[default]
    Default,
    /// Sixteen bytes at this offset of the sequence.
    Sequence(u16),
}

/// Player fade state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FadeState {
    /// Volume held or moving to a target.
    Normal,
    /// Waiting for a target; the next one starts from silence.
    FadeIn,
    /// Moving to silence; the player stops when it gets there.
    FadeOut,
}

/// Player volume fade.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Fade {
    state: FadeState,
    volume: f32,
    scale: f32,
    velocity: f32,
    remaining: u16,
    timer: u16,
}

impl Default for Fade {
    fn default() -> Self {
        Self {
            state: FadeState::FadeIn,
            volume: 1.0,
            scale: 1.0,
            velocity: 0.0,
            remaining: 0,
            timer: 0,
        }
    }
}

impl Fade {
    pub(crate) const fn state(&self) -> FadeState {
        self.state
    }

    pub(crate) const fn volume(&self) -> f32 {
        self.volume
    }

    pub(crate) const fn scale(&self) -> f32 {
        self.scale
    }

    pub(crate) fn set_scale(&mut self, scale: f32) {
        self.scale = scale;
    }

    /// Fade state instruction. States 0 and 1 only arm the timer used by
    /// the next target; state 2 starts a fade-out over `frames`.
    pub(crate) fn set_state(&mut self, state: u8, frames: u16) {
        match state {
            0 | 1 => {
                if self.state != FadeState::FadeOut {
                    self.timer = frames;
                    self.state = if state == 0 {
                        FadeState::Normal
                    } else {
                        FadeState::FadeIn
                    };
                }
            }
            2 => {
                self.state = FadeState::FadeOut;
                self.remaining = frames;
                if frames == 0 {
                    self.volume = 0.0;
                    self.velocity = 0.0;
                } else {
                    self.velocity = -self.volume / f32::from(frames);
                }
            }
            _ => tracing::trace!(state, "unknown fade state ignored"),
        }
    }

    /// Fade target instruction: move to `target / 127` over the armed timer.
    pub(crate) fn set_target(&mut self, target: u8) {
        let target = f32::from(target) / 127.0;
        match self.state {
            FadeState::FadeOut => return,
            FadeState::FadeIn => {
                self.state = FadeState::Normal;
                self.volume = 0.0;
            }
            FadeState::Normal => {}
        }
        self.remaining = self.timer;
        if self.timer == 0 {
            self.volume = target;
        } else {
            self.velocity = (target - self.volume) / f32::from(self.timer);
        }
    }

    /// Advances one tick. Returns true when a fade-out has finished.
    pub(crate) fn step(&mut self) -> bool {
        if self.remaining > 0 {
            self.volume = (self.volume + self.velocity).clamp(0.0, 1.0);
            self.remaining -= 1;
            if self.remaining > 0 {
                return false;
            }
            if self.state != FadeState::FadeOut {
                self.state = FadeState::Normal;
            }
        }
        self.state == FadeState::FadeOut
    }
}

/// A sequence player.
#[derive(Clone, Debug)]
pub struct Player {
    pub(crate) index: u8,
    pub(crate) enabled: bool,
    pub(crate) finished: bool,
    /// Holds its sequence and default bank; cleared once they are released.
    pub(crate) bound: bool,
    pub(crate) muted: bool,
    pub(crate) seq_id: u8,
    pub(crate) seq: Block,
    pub(crate) bank_set: BankSet,
    pub(crate) default_bank: u8,
    pub(crate) script: ScriptState,
    pub(crate) delay: u16,
    pub(crate) tempo: u16,
    pub(crate) tempo_acc: u32,
    pub(crate) transposition: i16,
    pub(crate) fade: Fade,
    pub(crate) mute_behavior: MuteBehavior,
    pub(crate) mute_volume_scale: f32,
    pub(crate) alloc_policy: u8,
    pub(crate) short_velocities: ShortTable,
    pub(crate) short_durations: ShortTable,
    pub(crate) value: i32,
    pub(crate) variation: i32,
    pub(crate) reserved: u8,
    pub(crate) channels: [Option<SlotHandle>; CHANNELS_PER_PLAYER],
}

/// A snapshot of a player for the host.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlayerState {
    /// Running its script.
    pub enabled: bool,
    /// Ended or was stopped.
    pub finished: bool,
    /// Sequence id.
    pub seq_id: u8,
    /// Default bank.
    pub default_bank: u8,
    /// Tempo in tatums per minute.
    pub tempo: u16,
    /// Fade volume.
    pub fade_volume: f32,
    /// Fade state.
    pub fade_state: FadeState,
    /// Muted flag.
    pub muted: bool,
    /// Enabled channels.
    pub active_channels: u8,
    /// Value register.
    pub value: i32,
}

impl Player {
    /// An idle player in slot `index`.
    #[must_use]
    pub fn new(index: u8) -> Self {
        Self {
            index,
            enabled: false,
            finished: false,
            bound: false,
            muted: false,
            seq_id: 0,
            seq: Block::new(0, 0),
            bank_set: BankSet::default(),
            default_bank: 0,
            script: ScriptState::default(),
            delay: 0,
            tempo: DEFAULT_TEMPO_BPM * TATUMS_PER_BEAT,
            tempo_acc: 0,
            transposition: 0,
            fade: Fade::default(),
            mute_behavior: MuteBehavior::all(),
            mute_volume_scale: 0.5,
            alloc_policy: 0,
            short_velocities: ShortTable::Default,
            short_durations: ShortTable::Default,
            value: 0,
            variation: -1,
            reserved: 0,
            channels: [None; CHANNELS_PER_PLAYER],
        }
    }

    /// Resets playback state and starts the script at offset 0.
    pub(crate) fn start(&mut self, binding: PlayerBinding) {
        let channels = self.channels;
        *self = Self::new(self.index);
        self.channels = channels;
        self.seq_id = binding.seq_id;
        self.seq = binding.seq;
        self.bank_set = binding.bank_set;
        self.default_bank = binding.default_bank;
        self.script = ScriptState::at(0);
        self.enabled = true;
        self.bound = true;
    }

    /// Slot index.
    #[inline]
    #[must_use]
    pub const fn index(&self) -> u8 {
        self.index
    }

    /// Returns true while the player runs.
    #[inline]
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns true once the player ended or was stopped.
    #[inline]
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Sequence id.
    #[inline]
    #[must_use]
    pub const fn seq_id(&self) -> u8 {
        self.seq_id
    }

    /// Tempo in tatums per minute.
    #[inline]
    #[must_use]
    pub const fn tempo(&self) -> u16 {
        self.tempo
    }

    /// Transposition in semitones.
    #[inline]
    #[must_use]
    pub const fn transposition(&self) -> i16 {
        self.transposition
    }

    /// Value register.
    #[inline]
    #[must_use]
    pub const fn value(&self) -> i32 {
        self.value
    }

    /// Variation register.
    #[inline]
    #[must_use]
    pub const fn variation(&self) -> i32 {
        self.variation
    }

    /// Fade volume.
    #[inline]
    #[must_use]
    pub const fn fade_volume(&self) -> f32 {
        self.fade.volume()
    }

    /// Muted flag.
    #[inline]
    #[must_use]
    pub const fn is_muted(&self) -> bool {
        self.muted
    }

    /// Handle of channel `index`, if allocated.
    #[must_use]
    pub fn channel_handle(&self, index: u8) -> Option<SlotHandle> {
        self.channels.get(usize::from(index)).copied().flatten()
    }

    pub(crate) fn state(&self, channels: &SlotPool<Channel>) -> PlayerState {
        let active = self
            .channels
            .iter()
            .flatten()
            .filter(|handle| channels.get(**handle).is_some_and(Channel::is_enabled))
            .count();
        PlayerState {
            enabled: self.enabled,
            finished: self.finished,
            seq_id: self.seq_id,
            default_bank: self.default_bank,
            tempo: self.tempo,
            fade_volume: self.fade.volume(),
            fade_state: self.fade.state(),
            muted: self.muted,
            active_channels: u8::try_from(active).unwrap_or(u8::MAX),
            value: self.value,
        }
    }

    pub(crate) fn muted_with(&self, behavior: MuteBehavior) -> bool {
        self.muted && self.mute_behavior.contains(behavior)
    }
}

impl Machine<'_> {
    /// One tick of a player: gate on content and tempo, run the script,
    /// then every channel.
    pub(super) fn run_player(&mut self, player: &mut Player) {
        if self.env.loader.has_active_job(player.index) {
            return;
        }

        let loader = &mut *self.env.loader;
        if !loader.status(ContentKind::Sequence, player.seq_id).is_loaded()
            || !loader.status(ContentKind::Bank, player.default_bank).is_loaded()
        {
            tracing::warn!(
                player = player.index,
                seq = player.seq_id,
                bank = player.default_bank,
                "sequence or bank disappeared"
            );
            self.disable_player(player);
            return;
        }
        loader.retain(ContentKind::Sequence, player.seq_id);
        loader.retain(ContentKind::Bank, player.default_bank);

        if player.muted_with(MuteBehavior::STOP_SCRIPT) {
            return;
        }

        player.tempo_acc += u32::from(player.tempo);
        let threshold = u32::from(self.env.tempo_internal);
        if player.tempo_acc < threshold {
            return;
        }
        player.tempo_acc -= threshold;

        if player.delay > 1 {
            player.delay -= 1;
        } else {
            match self.player_commands(player) {
                Ok(Flow::Yield) => {}
                Ok(Flow::Finish) => {
                    self.disable_player(player);
                    return;
                }
                Err(err) => {
                    tracing::warn!(player = player.index, %err, "player script fault");
                    self.disable_player(player);
                    return;
                }
            }
        }

        for handle in player.channels.into_iter().flatten() {
            self.run_channel(player, handle);
        }
    }

    fn player_commands(&mut self, player: &mut Player) -> Result<Flow, ScriptError> {
        for _ in 0..SCRIPT_INSTRUCTIONS_PER_TICK {
            let data = self.env.heap.slice(player.seq);
            let script = &mut player.script;
            let cmd = script.read_u8(data)?;

            if cmd >= 0xc0 {
                match cmd {
                    opcodes::END => {
                        if !script.ret() {
                            return Ok(Flow::Finish);
                        }
                    }
                    opcodes::DELAY => {
                        player.delay = script.read_compressed(data)?;
                        return Ok(Flow::Yield);
                    }
                    opcodes::YIELD => {
                        player.delay = 1;
                        return Ok(Flow::Yield);
                    }
                    opcodes::CALL => {
                        let target = script.read_u16(data)?;
                        script.call(target)?;
                    }
                    opcodes::LOOP => {
                        let count = script.read_u8(data)?;
                        script.loop_start(count)?;
                    }
                    opcodes::LOOP_END => script.loop_end()?,
                    opcodes::JUMP | opcodes::BEQZ | opcodes::BLTZ | opcodes::BGEZ => {
                        let target = script.read_u16(data)?;
                        if branch_taken(cmd, player.value) {
                            script.jump(target);
                        }
                    }
                    opcodes::JUMP_REL | opcodes::BEQZ_REL | opcodes::BLTZ_REL => {
                        let offset = script.read_s8(data)?;
                        if branch_taken(cmd, player.value) {
                            script.jump_relative(offset)?;
                        }
                    }
                    opcodes::RESERVE_VOICES => {
                        let count = script.read_u8(data)?;
                        player.reserved = count;
                        self.env
                            .synth
                            .reserve_voices(VoiceOwner::Player(player.index), count);
                    }
                    opcodes::UNRESERVE_VOICES => {
                        player.reserved = 0;
                        self.env.synth.reserve_voices(VoiceOwner::Player(player.index), 0);
                    }
                    op::TRANSPOSE => player.transposition = i16::from(script.read_s8(data)?),
                    op::TRANSPOSE_ADD => {
                        player.transposition += i16::from(script.read_s8(data)?);
                    }
                    op::TEMPO | op::TEMPO_ADD => {
                        let tempo = if cmd == op::TEMPO {
                            i32::from(script.read_u8(data)?) * i32::from(TATUMS_PER_BEAT)
                        } else {
                            i32::from(player.tempo)
                                + i32::from(script.read_s8(data)?) * i32::from(TATUMS_PER_BEAT)
                        };
                        let max = i32::from(self.env.tempo_internal);
                        player.tempo = u16::try_from(tempo.clamp(1, max)).unwrap_or(1);
                    }
                    op::FADE_STATE => {
                        let state = script.read_u8(data)?;
                        let frames = script.read_u16(data)?;
                        player.fade.set_state(state, frames);
                    }
                    op::FADE_VOLUME => {
                        let target = script.read_u8(data)?;
                        player.fade.set_target(target);
                    }
                    op::FADE_SCALE => {
                        let scale = script.read_s8(data)?;
                        player.fade.set_scale(f32::from(scale) / 127.0);
                    }
                    op::INIT_CHANNELS => {
                        let mask = script.read_u16(data)?;
                        self.init_channels(player, mask);
                    }
                    op::DISABLE_CHANNELS => {
                        let mask = script.read_u16(data)?;
                        self.disable_channels(player, mask);
                    }
                    op::MUTE_SCALE => {
                        player.mute_volume_scale = f32::from(script.read_s8(data)?) / 127.0;
                    }
                    op::MUTE => player.muted = true,
                    op::MUTE_BEHAVIOR => {
                        player.mute_behavior = MuteBehavior::from_bits_retain(script.read_u8(data)?);
                    }
                    op::SHORT_VELOCITIES => {
                        player.short_velocities = ShortTable::Sequence(script.read_u16(data)?);
                    }
                    op::SHORT_DURATIONS => {
                        player.short_durations = ShortTable::Sequence(script.read_u16(data)?);
                    }
                    op::ALLOC_POLICY => player.alloc_policy = script.read_u8(data)?,
                    opcodes::VALUE_SET => player.value = i32::from(script.read_u8(data)?),
                    opcodes::VALUE_AND => player.value &= i32::from(script.read_u8(data)?),
                    opcodes::VALUE_SUB => player.value -= i32::from(script.read_u8(data)?),
                    _ => tracing::trace!(player = player.index, cmd, "unknown player command"),
                }
                continue;
            }

            let lo = cmd & 0x0f;
            match cmd & 0xf0 {
                op::TEST_CHANNEL => {
                    player.value = player
                        .channel_handle(lo)
                        .and_then(|handle| self.channels.get(handle))
                        .map_or(1, |channel| i32::from(channel.is_finished()));
                }
                op::SUB_VARIATION => player.value -= player.variation,
                op::SET_VARIATION => player.variation = player.value,
                op::GET_VARIATION => player.value = player.variation,
                op::START_CHANNEL => {
                    let target = script.read_u16(data)?;
                    self.start_channel(player, lo, target);
                }
                _ => tracing::trace!(player = player.index, cmd, "unknown player command"),
            }
        }
        Err(ScriptError::Runaway { pc: player.script.pc() })
    }

    /// Stops a player, its channels and layers, and releases its content.
    pub(super) fn disable_player(&mut self, player: &mut Player) {
        self.disable_channels(player, 0xffff);
        if player.reserved > 0 {
            player.reserved = 0;
            self.env.synth.reserve_voices(VoiceOwner::Player(player.index), 0);
        }
        if player.enabled {
            tracing::debug!(player = player.index, seq = player.seq_id, "player disabled");
        }
        player.enabled = false;
        player.finished = true;

        if player.bound {
            player.bound = false;
            let loader = &mut *self.env.loader;
            loader.release(ContentKind::Sequence, player.seq_id);
            loader.release(ContentKind::Bank, player.default_bank);
            loader.steer_bank_eviction(player.default_bank);
        }
    }

    /// Allocates fresh channels for every bit of `mask`.
    pub(super) fn init_channels(&mut self, player: &mut Player, mask: u16) {
        for index in 0..CHANNELS_PER_PLAYER {
            if mask & (1 << index) == 0 {
                continue;
            }
            if let Some(old) = player.channels[index].take() {
                self.release_channel(old);
            }
            let channel_index = u8::try_from(index).unwrap_or(u8::MAX);
            match self.channels.allocate(Channel::new(player, channel_index)) {
                Ok(handle) => player.channels[index] = Some(handle),
                Err(err) => {
                    tracing::warn!(player = player.index, channel = index, %err, "no free channel");
                }
            }
        }
    }

    /// Disables and frees the channels of every bit of `mask`.
    pub(super) fn disable_channels(&mut self, player: &mut Player, mask: u16) {
        for index in 0..CHANNELS_PER_PLAYER {
            if mask & (1 << index) == 0 {
                continue;
            }
            if let Some(handle) = player.channels[index].take() {
                self.release_channel(handle);
            }
        }
    }

    fn release_channel(&mut self, handle: SlotHandle) {
        self.disable_channel(handle);
        if let Err(err) = self.channels.free(handle) {
            tracing::warn!(slot = handle.index(), %err, "channel free failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{one_instrument, player_prelude, Rig};
    use super::*;

    #[test]
    fn test_fade_out_reaches_zero() {
        let mut fade = Fade::default();
        fade.set_state(2, 4);
        assert_eq!(fade.state(), FadeState::FadeOut);
        assert!(!fade.step());
        assert!(!fade.step());
        assert!(!fade.step());
        assert!(fade.step());
        assert!(fade.volume().abs() < 1e-6);
    }

    #[test]
    fn test_fade_in_starts_from_silence() {
        let mut fade = Fade::default();
        fade.set_state(1, 2);
        fade.set_target(127);
        assert_eq!(fade.state(), FadeState::Normal);
        assert_eq!(fade.volume(), 0.0);
        fade.step();
        assert!((fade.volume() - 0.5).abs() < 1e-6);
        fade.step();
        assert!((fade.volume() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_fade_target_ignored_during_fade_out() {
        let mut fade = Fade::default();
        fade.set_state(2, 10);
        fade.set_target(127);
        fade.set_state(0, 5);
        assert_eq!(fade.state(), FadeState::FadeOut);
    }

    #[test]
    fn test_immediate_target() {
        let mut fade = Fade::default();
        fade.set_state(0, 0);
        fade.set_target(0);
        assert_eq!(fade.volume(), 0.0);
        assert!(!fade.step());
    }

    #[test]
    fn test_tempo_gates_script() {
        // Tempo 60 bpm with a 120 bpm threshold: the script runs every
        // second tick.
        let script = [0xdd, 60, 0xcc, 1, 0xfe, 0xcc, 2, 0xfe, 0xcc, 3, 0xfd, 100];
        let mut rig = Rig::new(one_instrument(), &script);
        rig.tick(1);
        assert_eq!(rig.player().value(), 1);
        assert_eq!(rig.player().tempo(), 60 * 48);
        rig.tick(1);
        assert_eq!(rig.player().value(), 1);
        rig.tick(1);
        assert_eq!(rig.player().value(), 2);
        rig.tick(2);
        assert_eq!(rig.player().value(), 3);
    }

    #[test]
    fn test_tempo_is_clamped() {
        let script = [0xdd, 250, 0xdc, 0x80, 0xfd, 100];
        let mut rig = Rig::new(one_instrument(), &script);
        rig.tick(1);
        // 250 bpm exceeds the threshold, then -128 bpm floors at 1.
        assert_eq!(rig.player().tempo(), 1);
    }

    #[test]
    fn test_value_and_variation() {
        // value = 10; variation = value; value = 3; value -= variation;
        let script = [0xcc, 10, 0x70, 0xcc, 3, 0x50, 0xfd, 100];
        let mut rig = Rig::new(one_instrument(), &script);
        rig.tick(1);
        assert_eq!(rig.player().variation(), 10);
        assert_eq!(rig.player().value(), -7);
    }

    #[test]
    fn test_loop_and_branch() {
        // 0: value = 0
        // 2: loop 3 { 4: transpose += 1 } 7
        // 7: beqz 12   (value is 0: taken)
        // 10: transpose = 50
        // 12: delay
        let script = [
            0xcc, 0, 0xf8, 3, 0xde, 1, 0xf7, 0xfa, 0, 12, 0xdf, 50, 0xfd, 100,
        ];
        let mut rig = Rig::new(one_instrument(), &script);
        rig.tick(1);
        assert_eq!(rig.player().transposition(), 3);
    }

    #[test]
    fn test_test_channel_reports_finished() {
        // Channel 0 ends immediately; the player then reads its flag.
        let mut script = player_prelude(12);
        // 6: yield, 7: test channel 0, 8: delay
        script.extend_from_slice(&[0xfe, 0x00, 0xfd, 100, 0, 0]);
        // 12: channel END
        script.push(0xff);
        let mut rig = Rig::new(one_instrument(), &script);
        rig.tick(1);
        assert!(rig.sequencer.channel(0, 0).unwrap().is_finished());
        assert_eq!(rig.player().value(), 0);
        rig.tick(1);
        assert_eq!(rig.player().value(), 1);
    }

    #[test]
    fn test_fade_out_disables_player() {
        let script = [0xda, 2, 0, 3, 0xfd, 100];
        let mut rig = Rig::new(one_instrument(), &script);
        rig.tick(2);
        assert!(rig.player().is_enabled());
        rig.tick(1);
        assert!(!rig.player().is_enabled());
    }

    #[test]
    fn test_mute_stops_script() {
        let script = [0xd4, 0xcc, 5, 0xfd, 100];
        let mut rig = Rig::new(one_instrument(), &script);
        rig.tick(1);
        // Mute ran, the rest of the script continues this tick.
        assert!(rig.player().is_muted());
        assert_eq!(rig.player().value(), 5);
    }

    #[test]
    fn test_jump_to_self_disables_player() {
        let mut rig = Rig::new(one_instrument(), &[0xfb, 0x00, 0x00]);
        rig.tick(1);
        assert!(!rig.player().is_enabled());
    }
}
