//! Per-tick voice parameters.
//!
//! After every script has run, each layer holding a voice composes its
//! parameters from its own state, its channel and its player:
//!
//! ```text
//! frequency = layer.freq_scale × channel.freq_scale × vibrato × glide
//! velocity  = layer.velocity² / 127² × channel.volume × channel.volume_scale
//!             × player.fade_volume × player.fade_scale [× mute scale]
//! pan       = (channel.pan × w + layer.pan × (128 − w)) / 128
//! ```

use std::f32::consts::TAU;

use super::{Channel, Layer, Machine, MuteBehavior, Player};

/// Largest squared velocity a script can set.
const VELOCITY_SQUARE_MAX: f32 = 127.0 * 127.0;

/// What the synthesizer is told about a voice each tick.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VoiceParams {
    /// Playback-rate multiplier.
    pub frequency: f32,
    /// Linear gain in `0.0..=1.0`.
    pub velocity: f32,
    /// Pan, 0 (left) to 127 (right).
    pub pan: u8,
    /// Reverb send.
    pub reverb: u8,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            frequency: 1.0,
            velocity: 0.0,
            pan: 0x40,
            reverb: 0,
        }
    }
}

/// Channel vibrato in script units.
///
/// Extents are 1/32768ths of the frequency, rates 1/65536ths of a cycle
/// per tick, times are ticks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VibratoSettings {
    /// Rate at note start.
    pub rate_start: u16,
    /// Rate after `rate_change_time`.
    pub rate_target: u16,
    /// Ticks the rate takes to ramp.
    pub rate_change_time: u16,
    /// Extent at note start.
    pub extent_start: u16,
    /// Extent after `extent_change_time`.
    pub extent_target: u16,
    /// Ticks the extent takes to ramp.
    pub extent_change_time: u16,
    /// Ticks before vibrato starts.
    pub delay: u16,
}

/// Vibrato progress of one voice.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct VibratoState {
    settings: VibratoSettings,
    time: u32,
    phase: f32,
}

impl VibratoState {
    pub(crate) const fn new(settings: VibratoSettings) -> Self {
        Self {
            settings,
            time: 0,
            phase: 0.0,
        }
    }

    /// Advances one tick and returns the frequency multiplier.
    pub(crate) fn step(&mut self) -> f32 {
        let time = self.time;
        self.time = self.time.saturating_add(1);
        let delay = u32::from(self.settings.delay);
        if time < delay {
            return 1.0;
        }
        let elapsed = time - delay;
        let s = &self.settings;
        let rate = ramp(s.rate_start, s.rate_target, s.rate_change_time, elapsed);
        let extent = ramp(s.extent_start, s.extent_target, s.extent_change_time, elapsed);
        if extent == 0.0 {
            return 1.0;
        }
        self.phase = (self.phase + rate / 65536.0).fract();
        1.0 + extent / 32768.0 * (TAU * self.phase).sin()
    }
}

fn ramp(start: u16, target: u16, time: u16, elapsed: u32) -> f32 {
    if time == 0 || elapsed >= u32::from(time) {
        return f32::from(target);
    }
    let t = elapsed as f32 / f32::from(time);
    f32::from(start) + (f32::from(target) - f32::from(start)) * t
}

/// Parameters of a voice-holding layer without modulation.
pub(crate) fn base_params(player: &Player, channel: &Channel, layer: &Layer) -> VoiceParams {
    let mut velocity = layer.velocity_square / VELOCITY_SQUARE_MAX
        * channel.volume
        * channel.volume_scale
        * player.fade.volume()
        * player.fade.scale();
    if player.muted && channel.mute_behavior.contains(MuteBehavior::SOFTEN) {
        velocity *= player.mute_volume_scale;
    }

    let weight = u32::from(channel.pan_weight.min(0x80));
    let pan = (u32::from(channel.pan) * weight + u32::from(layer.pan) * (0x80 - weight)) / 0x80;

    VoiceParams {
        frequency: layer.freq_scale * channel.freq_scale,
        velocity: velocity.clamp(0.0, 1.0),
        pan: u8::try_from(pan.min(0x7f)).unwrap_or(0x7f),
        reverb: channel.reverb,
    }
}

/// Composes the parameters of a voice-holding layer for this tick,
/// advancing its vibrato and glide.
pub(crate) fn compose(player: &Player, channel: &Channel, layer: &mut Layer) -> VoiceParams {
    let modulation = layer.vibrato.step() * layer.glide.step();
    let mut params = base_params(player, channel, layer);
    params.frequency *= modulation;
    params
}

impl Machine<'_> {
    /// Sends fresh parameters for every voice of `player`.
    pub(super) fn publish(&mut self, player: &Player) {
        for handle in player.channels.iter().flatten() {
            let Some(channel) = self.channels.get(*handle) else {
                continue;
            };
            for layer_handle in channel.layers.iter().flatten() {
                let Some(layer) = self.layers.get_mut(*layer_handle) else {
                    continue;
                };
                let Some(voice) = layer.voice else {
                    continue;
                };
                let params = compose(player, channel, layer);
                self.env.synth.update_voice(voice, &params);
            }
        }
    }
}
