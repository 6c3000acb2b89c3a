//! Sequence layers: the note level.
//!
//! A layer reads notes, rests and note properties, resolves each note to
//! a sound of its channel's bank and asks the synthesizer for a voice.
//! Between notes it counts down the play percentage; once the remaining
//! time drops to the note duration the voice is released.

use cadence_shared::constants::{PAN_CENTRE, SCRIPT_INSTRUCTIONS_PER_TICK};
use cadence_shared::{InstrumentRecord, SoundRecord};

use super::channel::resolve_instrument;
use super::opcodes::{self, layer as op};
use super::playback::{self, VibratoState};
use super::{Channel, Env, Instrument, MuteBehavior, Player, ScriptError, ScriptState, ShortTable};
use crate::synth::{Synthesizer, VoiceId, VoiceRequest, VoiceSource};

/// Semitones a melodic note may end up on.
const SEMITONE_LIMIT: i32 = 0x80;

/// Portamento setting of a layer.
///
/// The low seven bits pick the mode (0 is off). Bit 7 makes the time a
/// tempo-relative byte instead of a tick count.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Portamento {
    /// Mode and special flag.
    pub mode: u8,
    /// Target semitone.
    pub target: u8,
    /// Glide time.
    pub time: u16,
}

impl Portamento {
    const SPECIAL: u8 = 0x80;

    /// Mode without the special flag.
    #[inline]
    #[must_use]
    pub const fn kind(&self) -> u8 {
        self.mode & !Self::SPECIAL
    }

    /// Returns true if the glide time is tempo-relative.
    #[inline]
    #[must_use]
    pub const fn is_special(&self) -> bool {
        self.mode & Self::SPECIAL != 0
    }
}

/// Glide of the current note, as a multiplier on its base frequency.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct Glide {
    extent: f32,
    speed: f32,
    progress: f32,
    active: bool,
}

impl Glide {
    fn start(extent: f32, speed: f32) -> Self {
        Self {
            extent,
            speed,
            progress: 0.0,
            active: true,
        }
    }

    /// Advances one tick and returns the multiplier.
    pub(crate) fn step(&mut self) -> f32 {
        if !self.active {
            return 1.0;
        }
        self.progress = (self.progress + self.speed).min(1.0);
        1.0 + self.extent * self.progress
    }
}

/// What the script stopped on.
enum Event {
    Rest,
    Note(u8),
    End,
}

/// A sequence layer.
#[derive(Clone, Debug)]
pub struct Layer {
    pub(crate) index: u8,
    pub(crate) enabled: bool,
    pub(crate) finished: bool,
    pub(crate) stopped: bool,
    pub(crate) continuous: bool,
    pub(crate) ignore_drum_pan: bool,
    pub(crate) script: ScriptState,
    pub(crate) delay: u16,
    pub(crate) duration: u16,
    pub(crate) note_duration: u8,
    pub(crate) play_percentage: u16,
    pub(crate) default_play_percentage: u16,
    pub(crate) pan: u8,
    pub(crate) transposition: i8,
    pub(crate) velocity_square: f32,
    pub(crate) freq_scale: f32,
    pub(crate) instrument: Option<Instrument>,
    pub(crate) record: Option<InstrumentRecord>,
    pub(crate) envelope: Option<usize>,
    pub(crate) release_rate: u8,
    pub(crate) portamento: Portamento,
    pub(crate) glide: Glide,
    pub(crate) vibrato: VibratoState,
    pub(crate) source: Option<VoiceSource>,
    pub(crate) voice: Option<VoiceId>,
    pub(crate) voice_bank: Option<u8>,
}

impl Layer {
    /// An enabled layer of `channel` starting at `pc`.
    #[must_use]
    pub fn new(index: u8, channel: &Channel, pc: usize) -> Self {
        Self {
            index,
            enabled: true,
            finished: false,
            stopped: false,
            continuous: false,
            ignore_drum_pan: false,
            script: ScriptState::at(pc),
            delay: 0,
            duration: 0,
            note_duration: 0x80,
            play_percentage: 0,
            default_play_percentage: 0x80,
            pan: PAN_CENTRE,
            transposition: 0,
            velocity_square: 0.0,
            freq_scale: 1.0,
            instrument: None,
            record: None,
            envelope: channel.envelope,
            release_rate: 0,
            portamento: Portamento::default(),
            glide: Glide::default(),
            vibrato: VibratoState::default(),
            source: None,
            voice: None,
            voice_bank: None,
        }
    }

    /// Index inside the channel.
    #[inline]
    #[must_use]
    pub const fn index(&self) -> u8 {
        self.index
    }

    /// Returns true while the script runs.
    #[inline]
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns true once the script ended or the layer was disabled.
    #[inline]
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Returns true between the release point of a note and the next one.
    #[inline]
    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Voice currently held.
    #[inline]
    #[must_use]
    pub const fn voice(&self) -> Option<VoiceId> {
        self.voice
    }

    /// Ticks until the next note.
    #[inline]
    #[must_use]
    pub const fn delay(&self) -> u16 {
        self.delay
    }

    /// Ticks the current note sounds after its release point.
    #[inline]
    #[must_use]
    pub const fn duration(&self) -> u16 {
        self.duration
    }

    /// Note frequency multiplier before channel scaling and modulation.
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

    /// Portamento setting.
    #[inline]
    #[must_use]
    pub const fn portamento(&self) -> Portamento {
        self.portamento
    }

    /// Moves the held voice into release.
    pub(crate) fn decay(&mut self, synth: &mut dyn Synthesizer) {
        if let Some(voice) = self.voice.take() {
            synth.release_voice(voice);
        }
        self.voice_bank = None;
    }

    /// Releases the voice and stops the script.
    pub(crate) fn disable(&mut self, synth: &mut dyn Synthesizer) {
        self.decay(synth);
        self.enabled = false;
        self.finished = true;
    }

    /// Stops the script of a layer whose voice was already killed.
    pub(crate) fn disable_silently(&mut self) {
        self.voice = None;
        self.voice_bank = None;
        self.enabled = false;
        self.finished = true;
    }

    /// Takes the voice if it plays from `bank`.
    pub(crate) fn take_voice_from_bank(&mut self, bank: u8) -> Option<VoiceId> {
        if self.voice_bank != Some(bank) {
            return None;
        }
        self.voice_bank = None;
        self.voice.take()
    }

    /// Runs instructions up to the next note, rest or end, decoding the
    /// note timing on the way.
    #[allow(clippy::too_many_lines)]
    fn commands(
        &mut self,
        player: &Player,
        channel: &Channel,
        env: &mut Env<'_>,
    ) -> Result<Event, ScriptError> {
        let data = env.heap.slice(player.seq);
        for _ in 0..SCRIPT_INSTRUCTIONS_PER_TICK {
            let script = &mut self.script;
            let cmd = script.read_u8(data)?;
            if cmd <= op::REST {
                return self.note_timing(cmd, channel.large_notes, data);
            }

            match cmd {
                opcodes::END => {
                    if !script.ret() {
                        return Ok(Event::End);
                    }
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
                opcodes::JUMP => {
                    let target = script.read_u16(data)?;
                    script.jump(target);
                }
                opcodes::JUMP_REL => {
                    let offset = script.read_s8(data)?;
                    script.jump_relative(offset)?;
                }
                op::VELOCITY => {
                    let velocity = f32::from(script.read_u8(data)?);
                    self.velocity_square = velocity * velocity;
                }
                op::PAN => self.pan = script.read_u8(data)?,
                op::TRANSPOSE => self.transposition = script.read_s8(data)?,
                op::DURATION => self.note_duration = script.read_u8(data)?,
                op::CONTINUOUS_ON | op::CONTINUOUS_OFF => {
                    self.continuous = cmd == op::CONTINUOUS_ON;
                    self.decay(&mut *env.synth);
                }
                op::DEFAULT_PLAY_PERCENTAGE => {
                    self.default_play_percentage = script.read_compressed(data)?;
                }
                op::INSTRUMENT => {
                    let id = script.read_u8(data)?;
                    self.select_instrument(id, channel, env);
                }
                op::PORTAMENTO => {
                    let mode = script.read_u8(data)?;
                    let note = i32::from(script.read_u8(data)?)
                        + i32::from(channel.transposition)
                        + i32::from(self.transposition)
                        + i32::from(player.transposition);
                    let note = note.rem_euclid(0x100);
                    self.portamento.mode = mode;
                    self.portamento.target = if note < SEMITONE_LIMIT {
                        u8::try_from(note).unwrap_or(0)
                    } else {
                        0
                    };
                    self.portamento.time = if self.portamento.is_special() {
                        u16::from(script.read_u8(data)?)
                    } else {
                        script.read_compressed(data)?
                    };
                }
                op::PORTAMENTO_OFF => self.portamento.mode = 0,
                op::ENVELOPE => {
                    let offset = script.read_u16(data)?;
                    self.envelope = Some(player.seq.offset() + usize::from(offset));
                    self.release_rate = script.read_u8(data)?;
                }
                op::IGNORE_DRUM_PAN => self.ignore_drum_pan = true,
                _ => {
                    let lo = cmd & 0x0f;
                    match cmd & 0xf0 {
                        op::VELOCITY_FROM_TABLE => {
                            let velocity = f32::from(short_table(
                                player.short_velocities,
                                &env.tables.short_velocities,
                                data,
                                lo,
                            )?);
                            self.velocity_square = velocity * velocity;
                        }
                        op::DURATION_FROM_TABLE => {
                            self.note_duration = short_table(
                                player.short_durations,
                                &env.tables.short_durations,
                                data,
                                lo,
                            )?;
                        }
                        _ => tracing::trace!(player = player.index, cmd, "unknown layer command"),
                    }
                }
            }
        }
        Err(ScriptError::Runaway { pc: self.script.pc() })
    }

    /// Reads the operands of a rest or note byte and sets the timing.
    fn note_timing(&mut self, cmd: u8, large: bool, data: &[u8]) -> Result<Event, ScriptError> {
        let script = &mut self.script;
        if cmd == op::REST {
            self.delay = script.read_compressed(data)?;
            self.stopped = true;
            return Ok(Event::Rest);
        }
        self.stopped = false;

        let percentage = match (cmd & 0xc0, large) {
            (0x00, true) => {
                let percentage = script.read_compressed(data)?;
                let velocity = f32::from(script.read_u8(data)?);
                self.note_duration = script.read_u8(data)?;
                self.velocity_square = velocity * velocity;
                self.play_percentage = percentage;
                percentage
            }
            (0x40, true) => {
                let percentage = script.read_compressed(data)?;
                let velocity = f32::from(script.read_u8(data)?);
                self.note_duration = 0;
                self.velocity_square = velocity * velocity;
                self.play_percentage = percentage;
                percentage
            }
            (_, true) => {
                let velocity = f32::from(script.read_u8(data)?);
                self.note_duration = script.read_u8(data)?;
                self.velocity_square = velocity * velocity;
                self.play_percentage
            }
            (0x00, false) => {
                self.play_percentage = script.read_compressed(data)?;
                self.play_percentage
            }
            (0x40, false) => self.default_play_percentage,
            (_, false) => self.play_percentage,
        };

        self.delay = percentage;
        let duration = (u32::from(self.note_duration) * u32::from(percentage)) >> 8;
        self.duration = u16::try_from(duration).unwrap_or(u16::MAX);
        Ok(Event::Note(cmd & 0x3f))
    }

    fn select_instrument(&mut self, id: u8, channel: &Channel, env: &Env<'_>) {
        match id {
            0xff => {
                self.instrument = None;
                self.record = None;
                self.release_rate = 0;
            }
            0x7f..=0xfe => {
                let (instrument, _) = resolve_instrument(env, channel.bank, id);
                self.instrument = Some(instrument);
                self.record = None;
            }
            _ => match resolve_instrument(env, channel.bank, id) {
                (instrument, Some(record)) => {
                    self.instrument = Some(instrument);
                    self.record = Some(record);
                    self.envelope = usize::try_from(record.envelope).ok();
                    self.release_rate = record.release_rate;
                }
                _ => {
                    self.instrument = None;
                    self.record = None;
                }
            },
        }
    }

    /// Resolves note `base` to a source and frequency. Returns None if the
    /// note should not sound.
    fn resolve_note(
        &mut self,
        base: u8,
        player: &Player,
        channel: &Channel,
        env: &Env<'_>,
    ) -> Option<VoiceSource> {
        let (instrument, record) = match self.instrument {
            Some(instrument) => (instrument, self.record),
            None => (channel.instrument, channel.record),
        };

        match instrument {
            Instrument::None => None,
            Instrument::Drum => {
                let semitone = i32::from(base)
                    + i32::from(channel.transposition)
                    + i32::from(self.transposition);
                let index = u8::try_from(semitone).ok()?;
                let drum = env
                    .loader
                    .bank(channel.bank)
                    .and_then(|bank| bank.drum(env.heap, index))?;
                if drum.sound.sample == 0 {
                    return None;
                }
                self.envelope = usize::try_from(drum.envelope).ok();
                self.release_rate = drum.release_rate;
                if !self.ignore_drum_pan {
                    self.pan = drum.pan;
                }
                self.freq_scale = drum.sound.tuning;
                self.glide = Glide::default();
                Some(VoiceSource::Sample {
                    bank: channel.bank,
                    sound: drum.sound,
                })
            }
            Instrument::Wave(_) | Instrument::Melodic(_) => {
                let semitone = i32::from(base)
                    + i32::from(player.transposition)
                    + i32::from(channel.transposition)
                    + i32::from(self.transposition);
                if !(0..SEMITONE_LIMIT).contains(&semitone) {
                    return None;
                }
                let semitone = u8::try_from(semitone).ok()?;
                let sound_note = if self.portamento.kind() == 0 {
                    semitone
                } else {
                    semitone.max(self.portamento.target)
                };
                let (source, tuning) = match (instrument, record) {
                    (Instrument::Melodic(_), Some(record)) => {
                        let sound = sound_for(&record, sound_note);
                        if sound.sample == 0 {
                            return None;
                        }
                        let source = VoiceSource::Sample {
                            bank: channel.bank,
                            sound,
                        };
                        (source, sound.tuning)
                    }
                    (Instrument::Wave(wave), _) => (VoiceSource::Wave(wave), 1.0),
                    _ => return None,
                };

                let note_freq = env.tables.note_frequency(semitone) * tuning;
                if self.portamento.kind() == 0 {
                    self.freq_scale = note_freq;
                    self.glide = Glide::default();
                } else {
                    self.start_glide(semitone, note_freq, tuning, player, env);
                }
                Some(source)
            }
        }
    }

    fn start_glide(
        &mut self,
        semitone: u8,
        note_freq: f32,
        tuning: f32,
        player: &Player,
        env: &Env<'_>,
    ) {
        let portamento = self.portamento;
        let target_freq = env.tables.note_frequency(portamento.target) * tuning;
        let anchor = match portamento.kind() {
            1 | 3 | 5 => target_freq,
            _ => note_freq,
        };
        let extent = if anchor > 0.0 { note_freq / anchor - 1.0 } else { 0.0 };
        let time = f32::from(portamento.time.max(1));
        let speed = if portamento.is_special() {
            256.0 * f32::from(player.tempo)
                / (f32::from(self.delay.max(1)) * f32::from(env.tempo_internal) * time)
        } else {
            1.0 / time
        };
        self.freq_scale = anchor;
        self.glide = Glide::start(extent, speed);
        if portamento.kind() == 5 {
            self.portamento.target = semitone;
        }
    }
}

/// Sound of `record` for `semitone`.
fn sound_for(record: &InstrumentRecord, semitone: u8) -> SoundRecord {
    if semitone < record.range_lo {
        record.low
    } else if semitone <= record.range_hi {
        record.normal
    } else {
        record.high
    }
}

/// Entry `index` of a short-note table.
fn short_table(
    table: ShortTable,
    defaults: &[u8],
    data: &[u8],
    index: u8,
) -> Result<u8, ScriptError> {
    match table {
        ShortTable::Default => Ok(defaults.get(usize::from(index)).copied().unwrap_or(0)),
        ShortTable::Sequence(base) => {
            let offset = usize::from(base) + usize::from(index);
            data.get(offset)
                .copied()
                .ok_or(ScriptError::DataOutOfBounds { offset })
        }
    }
}

/// One tick of a layer.
pub(crate) fn run(layer: &mut Layer, player: &Player, channel: &Channel, env: &mut Env<'_>) {
    if !layer.enabled {
        return;
    }

    if layer.delay > 1 {
        layer.delay -= 1;
        if !layer.stopped && layer.delay <= layer.duration {
            layer.decay(&mut *env.synth);
            layer.stopped = true;
        }
        return;
    }

    if !layer.continuous {
        layer.decay(&mut *env.synth);
    }
    if matches!(layer.portamento.kind(), 1 | 2) {
        layer.portamento.mode = 0;
    }

    let base = match layer.commands(player, channel, env) {
        Ok(Event::Note(base)) => base,
        Ok(Event::Rest) => {
            if layer.voice.is_some() || layer.continuous {
                layer.decay(&mut *env.synth);
            }
            return;
        }
        Ok(Event::End) => {
            layer.disable(&mut *env.synth);
            return;
        }
        Err(err) => {
            tracing::warn!(
                player = player.index,
                channel = channel.index,
                layer = layer.index,
                %err,
                "layer script fault"
            );
            layer.disable(&mut *env.synth);
            return;
        }
    };

    let source = if player.muted && channel.mute_behavior.contains(MuteBehavior::STOP_NOTES) {
        None
    } else {
        layer.resolve_note(base, player, channel, env)
    };
    let Some(source) = source else {
        layer.stopped = true;
        if layer.voice.is_some() || layer.continuous {
            layer.decay(&mut *env.synth);
        }
        return;
    };

    let same_source = layer.source == Some(source);
    layer.source = Some(source);
    let reuse = layer.continuous && layer.voice.is_some() && same_source;
    if !reuse {
        layer.decay(&mut *env.synth);
        let request = VoiceRequest {
            player: player.index,
            channel: channel.index,
            layer: layer.index,
            source,
            priority: channel.priority,
            policy: channel.alloc_policy,
            envelope: layer.envelope.or(channel.envelope),
            release_rate: if layer.release_rate == 0 {
                channel.release_rate
            } else {
                layer.release_rate
            },
            sustain: channel.sustain,
            params: playback::base_params(player, channel, layer),
        };
        layer.voice = env.synth.allocate_voice(&request);
        if layer.voice.is_none() {
            tracing::trace!(
                player = player.index,
                channel = channel.index,
                layer = layer.index,
                "no voice for note"
            );
        }
        layer.voice_bank = match source {
            VoiceSource::Sample { bank, .. } if layer.voice.is_some() => Some(bank),
            _ => None,
        };
    }
    if layer.voice.is_some() {
        layer.vibrato = VibratoState::new(channel.vibrato);
    }
}
