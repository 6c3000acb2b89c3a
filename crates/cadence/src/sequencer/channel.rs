//! Sequence channels: the middle interpreter level.
//!
//! A channel holds instrument, volume, pan and vibrato settings shared by
//! its four layers, plus eight I/O ports the host and sibling channels use
//! to talk to its script.

use cadence_core::SlotHandle;
use cadence_shared::InstrumentRecord;
use cadence_shared::constants::{
    CHANNEL_IO_PORTS, LAYERS_PER_CHANNEL, NOTE_PRIORITY_DEFAULT, PAN_CENTRE,
    SCRIPT_INSTRUCTIONS_PER_TICK,
};

use super::opcodes::{self, channel as op};
use super::script::peek_u16;
use super::{
    branch_taken, Env, Flow, Layer, Machine, MuteBehavior, Player, ScriptError, ScriptState,
    VibratoSettings,
};
use crate::synth::VoiceOwner;

/// What notes of a channel or layer play.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Instrument {
    /// Nothing selected, or the selection failed; notes are skipped.
    #[default]
    None,
    /// A built-in waveform.
    Wave(u8),
    /// The drum kit of the channel's bank.
    Drum,
    /// Instrument slot of the channel's bank.
    Melodic(u8),
}

/// Maps an instrument byte to a selection, looking melodic ones up in
/// `bank`.
pub(crate) fn resolve_instrument(
    env: &Env<'_>,
    bank: u8,
    id: u8,
) -> (Instrument, Option<InstrumentRecord>) {
    match id {
        0x80..=0xff => (Instrument::Wave(id), None),
        0x7f => (Instrument::Drum, None),
        _ => match env
            .loader
            .bank(bank)
            .and_then(|entry| entry.instrument(env.heap, id))
        {
            Some(record) => (Instrument::Melodic(id), Some(record)),
            None => {
                tracing::debug!(bank, instrument = id, "instrument not in bank");
                (Instrument::None, None)
            }
        },
    }
}

/// Reads entry `index` of the dynamic table at `table`.
fn dyn_entry(data: &[u8], table: u16, index: i8) -> Result<u16, ScriptError> {
    let offset = usize::from(table) + 2 * usize::try_from(index).unwrap_or(usize::MAX / 4);
    peek_u16(data, offset).ok_or(ScriptError::DataOutOfBounds { offset })
}

/// A sequence channel.
#[derive(Clone, Debug)]
pub struct Channel {
    pub(crate) index: u8,
    pub(crate) player: u8,
    pub(crate) enabled: bool,
    pub(crate) finished: bool,
    pub(crate) stop_script: bool,
    pub(crate) large_notes: bool,
    pub(crate) script: ScriptState,
    pub(crate) delay: u16,
    pub(crate) value: i8,
    pub(crate) io: [i8; CHANNEL_IO_PORTS],
    pub(crate) bank: u8,
    pub(crate) instrument: Instrument,
    pub(crate) record: Option<InstrumentRecord>,
    pub(crate) envelope: Option<usize>,
    pub(crate) release_rate: u8,
    pub(crate) sustain: u8,
    pub(crate) volume: f32,
    pub(crate) volume_scale: f32,
    pub(crate) freq_scale: f32,
    pub(crate) pan: u8,
    pub(crate) pan_weight: u8,
    pub(crate) transposition: i8,
    pub(crate) priority: u8,
    pub(crate) mute_behavior: MuteBehavior,
    pub(crate) alloc_policy: u8,
    pub(crate) reverb: u8,
    pub(crate) reverb_index: u8,
    pub(crate) book_offset: u8,
    pub(crate) stereo: u8,
    pub(crate) vibrato: VibratoSettings,
    pub(crate) dyn_table: u16,
    pub(crate) reserved: u8,
    pub(crate) layers: [Option<SlotHandle>; LAYERS_PER_CHANNEL],
}

impl Channel {
    /// A disabled channel `index` of `player`, inheriting its bank and
    /// mute settings.
    #[must_use]
    pub fn new(player: &Player, index: u8) -> Self {
        Self {
            index,
            player: player.index,
            enabled: false,
            finished: false,
            stop_script: false,
            large_notes: false,
            script: ScriptState::default(),
            delay: 0,
            value: 0,
            io: [-1; CHANNEL_IO_PORTS],
            bank: player.default_bank,
            instrument: Instrument::None,
            record: None,
            envelope: None,
            release_rate: 0x20,
            sustain: 0,
            volume: 1.0,
            volume_scale: 1.0,
            freq_scale: 1.0,
            pan: PAN_CENTRE,
            pan_weight: 0x80,
            transposition: 0,
            priority: NOTE_PRIORITY_DEFAULT,
            mute_behavior: player.mute_behavior,
            alloc_policy: player.alloc_policy,
            reverb: 0,
            reverb_index: 0,
            book_offset: 0,
            stereo: 0,
            vibrato: VibratoSettings {
                rate_start: 0x800,
                rate_target: 0x800,
                ..VibratoSettings::default()
            },
            dyn_table: 0,
            reserved: 0,
            layers: [None; LAYERS_PER_CHANNEL],
        }
    }

    /// Index inside the player.
    #[inline]
    #[must_use]
    pub const fn index(&self) -> u8 {
        self.index
    }

    /// Returns true while the script or its layers run.
    #[inline]
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns true once the channel ended or was disabled.
    #[inline]
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// I/O port `port`; -1 for an empty or unknown port.
    #[must_use]
    pub fn io(&self, port: u8) -> i8 {
        self.io.get(usize::from(port)).copied().unwrap_or(-1)
    }

    /// Writes I/O port `port`; unknown ports are ignored.
    pub fn set_io(&mut self, port: u8, value: i8) {
        if let Some(slot) = self.io.get_mut(usize::from(port)) {
            *slot = value;
        }
    }

    /// Value register.
    #[inline]
    #[must_use]
    pub const fn value(&self) -> i8 {
        self.value
    }

    /// Bank notes are taken from.
    #[inline]
    #[must_use]
    pub const fn bank(&self) -> u8 {
        self.bank
    }

    /// Current instrument.
    #[inline]
    #[must_use]
    pub const fn instrument(&self) -> Instrument {
        self.instrument
    }

    /// Envelope heap offset, None for the default envelope.
    #[inline]
    #[must_use]
    pub const fn envelope(&self) -> Option<usize> {
        self.envelope
    }

    /// Volume.
    #[inline]
    #[must_use]
    pub const fn volume(&self) -> f32 {
        self.volume
    }

    /// Frequency multiplier.
    #[inline]
    #[must_use]
    pub const fn freq_scale(&self) -> f32 {
        self.freq_scale
    }

    /// Pan.
    #[inline]
    #[must_use]
    pub const fn pan(&self) -> u8 {
        self.pan
    }

    /// Transposition in semitones.
    #[inline]
    #[must_use]
    pub const fn transposition(&self) -> i8 {
        self.transposition
    }

    /// Note priority.
    #[inline]
    #[must_use]
    pub const fn priority(&self) -> u8 {
        self.priority
    }

    /// Reverb send.
    #[inline]
    #[must_use]
    pub const fn reverb(&self) -> u8 {
        self.reverb
    }

    /// Vibrato settings.
    #[inline]
    #[must_use]
    pub const fn vibrato(&self) -> VibratoSettings {
        self.vibrato
    }

    /// Handle of layer `index`, if allocated.
    #[must_use]
    pub fn layer_handle(&self, index: u8) -> Option<SlotHandle> {
        self.layers.get(usize::from(index)).copied().flatten()
    }

    fn owner(&self) -> VoiceOwner {
        VoiceOwner::Channel {
            player: self.player,
            channel: self.index,
        }
    }

    fn select_instrument(&mut self, id: u8, env: &Env<'_>) {
        let (instrument, record) = resolve_instrument(env, self.bank, id);
        self.instrument = instrument;
        self.record = record;
        if let Some(record) = record {
            self.envelope = usize::try_from(record.envelope).ok();
            self.release_rate = record.release_rate;
        }
    }

    /// The eight-byte parameter block of the params instructions.
    fn apply_params(&mut self, params: [u8; 8]) {
        let [mute, policy, priority, transposition, pan, weight, reverb, reverb_index] = params;
        self.mute_behavior = MuteBehavior::from_bits_retain(mute);
        self.alloc_policy = policy;
        self.priority = priority;
        self.transposition = i8::from_ne_bytes([transposition]);
        self.pan = pan;
        self.pan_weight = weight;
        self.reverb = reverb;
        self.reverb_index = reverb_index;
    }
}

impl Machine<'_> {
    /// One tick of a channel: script unless delayed or stopped, then layers.
    pub(super) fn run_channel(&mut self, player: &Player, handle: SlotHandle) {
        let Some(channel) = self.channels.get_mut(handle) else {
            return;
        };
        if !channel.enabled {
            return;
        }

        if !channel.stop_script {
            if player.muted && channel.mute_behavior.contains(MuteBehavior::STOP_SCRIPT) {
                return;
            }
            if channel.delay != 0 {
                channel.delay -= 1;
            }
            if channel.delay == 0 {
                match self.channel_commands(player, handle) {
                    Ok(Flow::Yield) => {}
                    Ok(Flow::Finish) => self.disable_channel(handle),
                    Err(err) => {
                        let index = self.channels.get(handle).map_or(0, Channel::index);
                        tracing::warn!(
                            player = player.index,
                            channel = index,
                            %err,
                            "channel script fault"
                        );
                        self.disable_channel(handle);
                    }
                }
            }
        }

        self.run_layers(player, handle);
    }

    #[allow(clippy::too_many_lines)]
    fn channel_commands(&mut self, player: &Player, handle: SlotHandle) -> Result<Flow, ScriptError> {
        for _ in 0..SCRIPT_INSTRUCTIONS_PER_TICK {
            let Some(channel) = self.channels.get_mut(handle) else {
                return Ok(Flow::Finish);
            };
            let data = self.env.heap.slice(player.seq);
            let script = &mut channel.script;
            let cmd = script.read_u8(data)?;

            if cmd > 0xc0 {
                match cmd {
                    opcodes::END => {
                        if !script.ret() {
                            return Ok(Flow::Finish);
                        }
                    }
                    opcodes::YIELD => return Ok(Flow::Yield),
                    opcodes::DELAY => {
                        channel.delay = script.read_compressed(data)?;
                        return Ok(Flow::Yield);
                    }
                    op::STOP_SCRIPT => {
                        channel.stop_script = true;
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
                    opcodes::BREAK => script.break_loop()?,
                    opcodes::JUMP | opcodes::BEQZ | opcodes::BLTZ | opcodes::BGEZ => {
                        let target = script.read_u16(data)?;
                        if branch_taken(cmd, i32::from(channel.value)) {
                            script.jump(target);
                        }
                    }
                    opcodes::JUMP_REL | opcodes::BEQZ_REL | opcodes::BLTZ_REL => {
                        let offset = script.read_s8(data)?;
                        if branch_taken(cmd, i32::from(channel.value)) {
                            script.jump_relative(offset)?;
                        }
                    }
                    opcodes::RESERVE_VOICES | opcodes::UNRESERVE_VOICES => {
                        let count = if cmd == opcodes::RESERVE_VOICES {
                            script.read_u8(data)?
                        } else {
                            0
                        };
                        channel.reserved = count;
                        self.env.synth.reserve_voices(channel.owner(), count);
                    }
                    op::DYN_TABLE => channel.dyn_table = script.read_u16(data)?,
                    op::DYN_SET_DYN_TABLE => {
                        if channel.value != -1 {
                            channel.dyn_table = dyn_entry(data, channel.dyn_table, channel.value)?;
                        }
                    }
                    op::DYN_CALL => {
                        if channel.value != -1 {
                            let target = dyn_entry(data, channel.dyn_table, channel.value)?;
                            script.call(target)?;
                        }
                    }
                    op::BANK_AND_INSTRUMENT | op::BANK => {
                        let index = script.read_u8(data)?;
                        match player.bank_set.select(index) {
                            Some(bank) if self.env.loader.bank_cached(bank) => channel.bank = bank,
                            selected => tracing::debug!(
                                player = player.index,
                                index,
                                bank = ?selected,
                                "bank not cached"
                            ),
                        }
                        if cmd == op::BANK_AND_INSTRUMENT {
                            let id = script.read_u8(data)?;
                            channel.select_instrument(id, &self.env);
                        }
                    }
                    op::INSTRUMENT => {
                        let id = script.read_u8(data)?;
                        channel.select_instrument(id, &self.env);
                    }
                    op::LARGE_NOTES_OFF => channel.large_notes = false,
                    op::LARGE_NOTES_ON => channel.large_notes = true,
                    op::VOLUME => channel.volume = f32::from(script.read_u8(data)?) / 127.0,
                    op::VOLUME_SCALE => {
                        channel.volume_scale = f32::from(script.read_u8(data)?) / 128.0;
                    }
                    op::FREQ_SCALE => {
                        channel.freq_scale = f32::from(script.read_u16(data)?) / 32768.0;
                    }
                    op::PITCH_BEND => {
                        let bend = i32::from(script.read_s8(data)?);
                        channel.freq_scale = self.env.tables.pitch_bend(bend + 127);
                    }
                    op::PAN => channel.pan = script.read_u8(data)?,
                    op::PAN_MIX => channel.pan_weight = script.read_u8(data)?,
                    op::TRANSPOSE => channel.transposition = script.read_s8(data)?,
                    op::ENVELOPE => {
                        let offset = script.read_u16(data)?;
                        channel.envelope = Some(player.seq.offset() + usize::from(offset));
                    }
                    op::RELEASE_RATE => channel.release_rate = script.read_u8(data)?,
                    op::VIBRATO_EXTENT => {
                        channel.vibrato.extent_target = u16::from(script.read_u8(data)?) * 8;
                        channel.vibrato.extent_start = 0;
                        channel.vibrato.extent_change_time = 0;
                    }
                    op::VIBRATO_RATE => {
                        let rate = u16::from(script.read_u8(data)?) * 32;
                        channel.vibrato.rate_start = rate;
                        channel.vibrato.rate_target = rate;
                        channel.vibrato.rate_change_time = 0;
                    }
                    op::VIBRATO_EXTENT_LINEAR => {
                        channel.vibrato.extent_start = u16::from(script.read_u8(data)?) * 8;
                        channel.vibrato.extent_target = u16::from(script.read_u8(data)?) * 8;
                        channel.vibrato.extent_change_time = u16::from(script.read_u8(data)?) * 16;
                    }
                    op::VIBRATO_RATE_LINEAR => {
                        channel.vibrato.rate_start = u16::from(script.read_u8(data)?) * 32;
                        channel.vibrato.rate_target = u16::from(script.read_u8(data)?) * 32;
                        channel.vibrato.rate_change_time = u16::from(script.read_u8(data)?) * 16;
                    }
                    op::VIBRATO_DELAY => {
                        channel.vibrato.delay = u16::from(script.read_u8(data)?) * 16;
                    }
                    op::RESET_VIBRATO => {
                        channel.vibrato = VibratoSettings::default();
                        channel.freq_scale = 1.0;
                    }
                    op::REVERB => channel.reverb = script.read_u8(data)?,
                    op::REVERB_INDEX => channel.reverb_index = script.read_u8(data)?,
                    op::WRITE_SEQ => {
                        let add = script.read_u8(data)?;
                        let offset = usize::from(script.read_u16(data)?);
                        let byte = u8::from_ne_bytes(channel.value.to_ne_bytes()).wrapping_add(add);
                        let target = self
                            .env
                            .heap
                            .slice_mut(player.seq)
                            .get_mut(offset)
                            .ok_or(ScriptError::DataOutOfBounds { offset })?;
                        *target = byte;
                    }
                    op::READ_SEQ => {
                        let base = script.read_u16(data)?;
                        let offset = usize::try_from(i32::from(base) + i32::from(channel.value))
                            .map_err(|_| ScriptError::DataOutOfBounds {
                                offset: usize::from(base),
                            })?;
                        let byte = *data
                            .get(offset)
                            .ok_or(ScriptError::DataOutOfBounds { offset })?;
                        channel.value = i8::from_ne_bytes([byte]);
                    }
                    opcodes::VALUE_SUB => {
                        channel.value = channel.value.wrapping_sub(script.read_s8(data)?);
                    }
                    opcodes::VALUE_AND => channel.value &= script.read_s8(data)?,
                    opcodes::VALUE_SET => channel.value = script.read_s8(data)?,
                    op::MUTE_BEHAVIOR => {
                        channel.mute_behavior = MuteBehavior::from_bits_retain(script.read_u8(data)?);
                    }
                    op::STEREO => channel.stereo = script.read_u8(data)?,
                    op::ALLOC_POLICY => channel.alloc_policy = script.read_u8(data)?,
                    op::SUSTAIN => channel.sustain = script.read_u8(data)?,
                    op::BOOK_OFFSET => channel.book_offset = script.read_u8(data)?,
                    op::PARAMS_FROM_SEQ => {
                        let offset = usize::from(script.read_u16(data)?);
                        let params = data
                            .get(offset..offset + 8)
                            .and_then(|bytes| <[u8; 8]>::try_from(bytes).ok())
                            .ok_or(ScriptError::DataOutOfBounds { offset })?;
                        channel.apply_params(params);
                    }
                    op::PARAMS => {
                        let mut params = [0u8; 8];
                        for byte in &mut params {
                            *byte = script.read_u8(data)?;
                        }
                        channel.apply_params(params);
                    }
                    op::PRIORITY => channel.priority = script.read_u8(data)?,
                    _ => tracing::trace!(player = player.index, cmd, "unknown channel command"),
                }
                continue;
            }

            let lo = cmd & 0x0f;
            match cmd & 0xf0 {
                op::TEST_LAYER => {
                    channel.value = channel
                        .layer_handle(lo)
                        .and_then(|layer| self.layers.get(layer))
                        .map_or(-1, |layer| i8::from(layer.is_finished()));
                }
                op::START_CHANNEL => {
                    let target = script.read_u16(data)?;
                    self.start_channel(player, lo, target);
                }
                op::DISABLE_CHANNEL => {
                    if let Some(sibling) = player.channel_handle(lo) {
                        self.disable_channel(sibling);
                    }
                }
                op::IO_WRITE_OTHER => {
                    let port = script.read_u8(data)?;
                    let value = channel.value;
                    if let Some(sibling) = player
                        .channel_handle(lo)
                        .and_then(|sibling| self.channels.get_mut(sibling))
                    {
                        sibling.set_io(port, value);
                    }
                }
                op::IO_READ_OTHER => {
                    let port = script.read_u8(data)?;
                    let value = player
                        .channel_handle(lo)
                        .and_then(|sibling| self.channels.get(sibling))
                        .map_or(-1, |sibling| sibling.io(port));
                    if let Some(channel) = self.channels.get_mut(handle) {
                        channel.value = value;
                    }
                }
                op::IO_SUB => channel.value = channel.value.wrapping_sub(channel.io(lo)),
                op::DELAY_SHORT => {
                    channel.delay = u16::from(lo);
                    return Ok(Flow::Yield);
                }
                op::IO_WRITE => {
                    let value = channel.value;
                    channel.set_io(lo, value);
                }
                op::IO_READ => {
                    channel.value = channel.io(lo);
                    if lo < 4 {
                        channel.set_io(lo, -1);
                    }
                }
                op::SET_LAYER => {
                    let target = script.read_u16(data)?;
                    self.set_layer(handle, lo, target);
                }
                op::FREE_LAYER => self.free_layer(handle, lo),
                op::DYN_SET_LAYER => {
                    if channel.value != -1 {
                        let target = dyn_entry(data, channel.dyn_table, channel.value)?;
                        self.set_layer(handle, lo, target);
                    }
                }
                _ => tracing::trace!(player = player.index, cmd, "unknown channel command"),
            }
        }
        let pc = self.channels.get(handle).map_or(0, |channel| channel.script.pc());
        Err(ScriptError::Runaway { pc })
    }

    fn run_layers(&mut self, player: &Player, handle: SlotHandle) {
        let Some(channel) = self.channels.get(handle) else {
            return;
        };
        for layer_handle in channel.layers.iter().flatten() {
            if let Some(layer) = self.layers.get_mut(*layer_handle) {
                super::layer::run(layer, player, channel, &mut self.env);
            }
        }
    }

    /// Starts channel `index` of `player` at `pc`, freeing its layers.
    pub(super) fn start_channel(&mut self, player: &Player, index: u8, pc: u16) {
        let Some(channel) = player
            .channel_handle(index)
            .and_then(|handle| self.channels.get_mut(handle))
        else {
            tracing::debug!(player = player.index, channel = index, "channel not allocated");
            return;
        };
        channel.enabled = true;
        channel.finished = false;
        channel.script = ScriptState::at(usize::from(pc));
        channel.delay = 0;
        let layers = std::mem::take(&mut channel.layers);
        for layer in layers.into_iter().flatten() {
            self.release_layer(layer);
        }
    }

    /// Disables a channel and frees its layers. The channel stays with its
    /// player.
    pub(super) fn disable_channel(&mut self, handle: SlotHandle) {
        let Some(channel) = self.channels.get_mut(handle) else {
            return;
        };
        channel.enabled = false;
        channel.finished = true;
        let layers = std::mem::take(&mut channel.layers);
        let owner = channel.owner();
        let reserved = std::mem::take(&mut channel.reserved);
        for layer in layers.into_iter().flatten() {
            self.release_layer(layer);
        }
        if reserved > 0 {
            self.env.synth.reserve_voices(owner, 0);
        }
    }

    /// Points layer `index` of a channel at `pc`, allocating it if needed.
    fn set_layer(&mut self, handle: SlotHandle, index: u8, pc: u16) {
        let Some(channel) = self.channels.get_mut(handle) else {
            return;
        };
        let slot = usize::from(index);
        if slot >= LAYERS_PER_CHANNEL {
            tracing::debug!(channel = channel.index, layer = index, "layer index out of range");
            return;
        }
        let fresh = Layer::new(index, channel, usize::from(pc));
        let existing = channel.layers[slot];
        match existing {
            Some(existing) => {
                if let Some(layer) = self.layers.get_mut(existing) {
                    layer.decay(&mut *self.env.synth);
                    *layer = fresh;
                }
            }
            None => match self.layers.allocate(fresh) {
                Ok(layer) => channel.layers[slot] = Some(layer),
                Err(err) => {
                    tracing::warn!(channel = channel.index, layer = index, %err, "no free layer");
                }
            },
        }
    }

    fn free_layer(&mut self, handle: SlotHandle, index: u8) {
        let layer = self
            .channels
            .get_mut(handle)
            .and_then(|channel| channel.layers.get_mut(usize::from(index)))
            .and_then(Option::take);
        if let Some(layer) = layer {
            self.release_layer(layer);
        }
    }

    fn release_layer(&mut self, handle: SlotHandle) {
        match self.layers.free(handle) {
            Ok(mut layer) => layer.disable(&mut *self.env.synth),
            Err(err) => tracing::warn!(slot = handle.index(), %err, "layer free failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{one_instrument, player_prelude, Rig};
    use super::*;
    use crate::builder::BankBuilder;

    /// Player that starts channel 0 at offset 8 and idles.
    fn channel_script(body: &[u8]) -> Vec<u8> {
        let mut script = player_prelude(8);
        script.extend_from_slice(&[0xfd, 100]);
        script.extend_from_slice(body);
        script
    }

    fn channel(rig: &Rig) -> &Channel {
        rig.sequencer.channel(0, 0).unwrap()
    }

    #[test]
    fn test_instrument_selection() {
        let bank = BankBuilder::new()
            .sample(&[0; 16])
            .instrument(0, 1.0)
            .empty_instrument();
        let mut rig = Rig::new(bank, &channel_script(&[0xc1, 0x00, 0xfd, 100]));
        rig.tick(1);
        assert_eq!(channel(&rig).instrument(), Instrument::Melodic(0));
        assert!(channel(&rig).envelope().is_some());

        let bank = BankBuilder::new().sample(&[0; 16]).empty_instrument();
        let mut rig = Rig::new(bank, &channel_script(&[0xc1, 0x00, 0xfd, 100]));
        rig.tick(1);
        assert_eq!(channel(&rig).instrument(), Instrument::None);

        let mut rig = Rig::new(one_instrument(), &channel_script(&[0xc1, 0x7f, 0xc1, 0x85, 0xfd, 100]));
        rig.tick(1);
        assert_eq!(channel(&rig).instrument(), Instrument::Wave(0x85));
    }

    #[test]
    fn test_io_ports() {
        // value = 9; io[6] = value; value = io[6]; io[2] = value;
        // value = io[2] (clears port 2); value -= io[6]
        let body = [0xcc, 9, 0x76, 0x86, 0x72, 0x82, 0x56, 0xfd, 100];
        let mut rig = Rig::new(one_instrument(), &channel_script(&body));
        rig.tick(1);
        let channel = channel(&rig);
        assert_eq!(channel.io(6), 9);
        assert_eq!(channel.io(2), -1);
        assert_eq!(channel.value(), 0);
    }

    #[test]
    fn test_host_io_is_read_by_script() {
        // 8: delay 2, 10: value = io[0], 11: delay
        let body = [0xfd, 2, 0x80, 0xfd, 100];
        let mut rig = Rig::new(one_instrument(), &channel_script(&body));
        rig.tick(1);
        rig.sequencer.set_channel_io(0, 0, 0, 17).unwrap();
        rig.tick(2);
        assert_eq!(channel(&rig).value(), 17);
        assert_eq!(channel(&rig).io(0), -1);
    }

    #[test]
    fn test_sequence_data_access() {
        // 8: value = 5, 10: write value + 1 to 21, 14: value = 0,
        // 16: read [21 + 0], 19: delay, 21: pad
        let body = [
            0xcc, 5, 0xc7, 1, 0, 21, 0xcc, 0, 0xcb, 0, 21, 0xfd, 100, 0,
        ];
        let mut rig = Rig::new(one_instrument(), &channel_script(&body));
        rig.tick(1);
        assert_eq!(channel(&rig).value(), 6);
    }

    #[test]
    fn test_read_past_sequence_disables_channel() {
        let body = [0xcb, 0x10, 0x00, 0xfd, 100];
        let mut rig = Rig::new(one_instrument(), &channel_script(&body));
        rig.tick(1);
        assert!(!channel(&rig).is_enabled());
        assert!(channel(&rig).is_finished());
        assert!(rig.player().is_enabled());
    }

    #[test]
    fn test_dynamic_call() {
        // 8: dyn table at 20, 11: value = 1, 13: dyncall, 14: delay
        // 20: table [0x0000, 0x0018], 24: pan 0x10, end
        let body = [
            0xc2, 0, 20, 0xcc, 1, 0xe4, 0xfd, 100, 0, 0, 0, 0, 0x00, 0x00, 0x00, 24, 0xdd, 0x10,
            0xff,
        ];
        let mut rig = Rig::new(one_instrument(), &channel_script(&body));
        rig.tick(1);
        assert_eq!(channel(&rig).pan(), 0x10);
    }

    #[test]
    fn test_params_inline() {
        let body = [0xe8, 0x40, 1, 5, 0xfe, 0x20, 0x60, 9, 2, 0xfd, 100];
        let mut rig = Rig::new(one_instrument(), &channel_script(&body));
        rig.tick(1);
        let channel = channel(&rig);
        assert_eq!(channel.priority(), 5);
        assert_eq!(channel.transposition(), -2);
        assert_eq!(channel.pan(), 0x20);
        assert_eq!(channel.reverb(), 9);
    }

    #[test]
    fn test_pitch_bend_and_reset() {
        let body = [0xd3, 10, 0xfe, 0xe2, 4, 8, 2, 0xec, 0xfd, 100];
        let mut rig = Rig::new(one_instrument(), &channel_script(&body));
        rig.tick(1);
        let bent = rig.sequencer.tables().pitch_bend(137);
        assert!(bent > 1.0);
        assert!((channel(&rig).freq_scale() - bent).abs() < 1e-6);
        rig.tick(1);
        assert!((channel(&rig).freq_scale() - 1.0).abs() < 1e-6);
        assert_eq!(channel(&rig).vibrato(), VibratoSettings::default());
    }

    #[test]
    fn test_vibrato_settings() {
        let body = [0xe1, 1, 2, 3, 0xe2, 4, 5, 6, 0xe3, 7, 0xfd, 100];
        let mut rig = Rig::new(one_instrument(), &channel_script(&body));
        rig.tick(1);
        let vibrato = channel(&rig).vibrato();
        assert_eq!(vibrato.rate_start, 32);
        assert_eq!(vibrato.rate_target, 64);
        assert_eq!(vibrato.rate_change_time, 48);
        assert_eq!(vibrato.extent_start, 32);
        assert_eq!(vibrato.extent_target, 40);
        assert_eq!(vibrato.extent_change_time, 96);
        assert_eq!(vibrato.delay, 112);
    }

    #[test]
    fn test_stop_script_keeps_layers_running() {
        // 8: layer 0 at 16, 11: stop script, 12: value = 1 (never runs)
        // 16: layer: velocity 100, rest 2, loop back
        let body = [0x90, 0, 16, 0xea, 0xcc, 1, 0xff, 0, 0xc1, 100, 0xc0, 2, 0xf4, 0xfc];
        let mut rig = Rig::new(one_instrument(), &channel_script(&body));
        rig.tick(3);
        assert_eq!(channel(&rig).value(), 0);
        let layer = rig.sequencer.layer(0, 0, 0).unwrap();
        assert!(layer.is_enabled());
    }

    #[test]
    fn test_sibling_channels() {
        // Player: init channels 0 and 1, start 0 at 8, idle.
        // 8: start sibling 1 at 17, value = 4, write to sibling port 3, delay
        // 17: delay
        let mut script = vec![0xd7, 0x00, 0x03, 0x90, 0, 8, 0xfd, 100];
        script.extend_from_slice(&[0x11, 0, 17, 0xcc, 4, 0x31, 3, 0xfd, 100]);
        script.extend_from_slice(&[0xfd, 100]);
        let mut rig = Rig::new(one_instrument(), &script);
        rig.tick(1);
        let sibling = rig.sequencer.channel(0, 1).unwrap();
        assert!(sibling.is_enabled());
        assert_eq!(sibling.io(3), 4);
    }

    #[test]
    fn test_jump_to_self_disables_channel() {
        let mut rig = Rig::new(one_instrument(), &channel_script(&[0xfb, 0x00, 8]));
        rig.tick(1);
        assert!(!channel(&rig).is_enabled());
        assert!(rig.player().is_enabled());
    }
}
