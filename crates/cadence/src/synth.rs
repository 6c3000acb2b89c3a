//! # Synthesis Collaborator
//!
//! The sequencer decides which notes sound and how; mixing and resampling
//! belong to whatever implements [`Synthesizer`]. The engine only talks to
//! voices through this trait.
//!
//! [`VoiceRecorder`] is an implementation that keeps a log instead of
//! producing audio. Tests and the runner binary use it.

use cadence_shared::{SessionPreset, SoundRecord};

use crate::sequencer::VoiceParams;

/// Handle to a voice owned by the synthesizer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VoiceId(pub u32);

/// Who voices are reserved for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VoiceOwner {
    /// A sequence player.
    Player(u8),
    /// One channel of a sequence player.
    Channel {
        /// Player index.
        player: u8,
        /// Channel index inside the player.
        channel: u8,
    },
}

/// What a voice plays.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum VoiceSource {
    /// A bank sample. Record offsets are heap-absolute.
    Sample {
        /// Bank holding the sound.
        bank: u8,
        /// Sample reference and tuning.
        sound: SoundRecord,
    },
    /// A built-in synthetic waveform.
    Wave(u8),
}

/// Everything needed to start a voice.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VoiceRequest {
    /// Player index.
    pub player: u8,
    /// Channel index inside the player.
    pub channel: u8,
    /// Layer index inside the channel.
    pub layer: u8,
    /// Sound source.
    pub source: VoiceSource,
    /// Note priority; higher steals lower.
    pub priority: u8,
    /// Allocation policy bits.
    pub policy: u8,
    /// Heap offset of the envelope, or None for the default envelope.
    pub envelope: Option<usize>,
    /// Envelope release rate.
    pub release_rate: u8,
    /// Envelope sustain level.
    pub sustain: u8,
    /// Starting parameters.
    pub params: VoiceParams,
}

/// The synthesis side of the engine.
pub trait Synthesizer {
    /// Applies the session preset (output rate, voice count, volume).
    fn configure(&mut self, preset: &SessionPreset);

    /// Starts a voice, or returns None when none can be found or stolen.
    fn allocate_voice(&mut self, request: &VoiceRequest) -> Option<VoiceId>;

    /// Updates a playing voice.
    fn update_voice(&mut self, voice: VoiceId, params: &VoiceParams);

    /// Moves a voice into its release phase.
    fn release_voice(&mut self, voice: VoiceId);

    /// Stops a voice immediately.
    fn kill_voice(&mut self, voice: VoiceId);

    /// Reserves `count` voices for `owner`; 0 gives them back.
    fn reserve_voices(&mut self, owner: VoiceOwner, count: u8);

    /// Fades the whole output out over `ticks`.
    fn fade_out(&mut self, ticks: u16);

    /// Silences the output buffers.
    fn mute(&mut self);

    /// Lowers every reverb gain by one eighth.
    fn decrease_reverb_gain(&mut self);

    /// Voices currently allocated.
    fn active_voices(&self) -> usize;
}

/// Something a [`VoiceRecorder`] saw.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SynthEvent {
    /// A voice started.
    Allocated(VoiceId, VoiceRequest),
    /// Allocation failed.
    Refused(VoiceRequest),
    /// A voice entered release.
    Released(VoiceId),
    /// A voice was stopped.
    Killed(VoiceId),
    /// Voices reserved.
    Reserved(VoiceOwner, u8),
    /// Output fade.
    FadeOut(u16),
    /// Output muted.
    Muted,
    /// Reverb lowered.
    ReverbDecreased,
    /// Preset applied.
    Configured {
        /// Output rate.
        frequency: u32,
        /// Voice count.
        max_voices: u8,
    },
}

/// A synthesizer that records what it is asked to do.
#[derive(Clone, Debug, Default)]
pub struct VoiceRecorder {
    events: Vec<SynthEvent>,
    live: Vec<(VoiceId, VoiceParams)>,
    limit: usize,
    next_id: u32,
    updates: u64,
    reverb_gain: f32,
}

impl VoiceRecorder {
    /// A recorder that accepts up to `limit` simultaneous voices.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            events: Vec::new(),
            live: Vec::with_capacity(limit),
            limit,
            next_id: 0,
            updates: 0,
            reverb_gain: 1.0,
        }
    }

    /// Every event in order.
    #[inline]
    #[must_use]
    pub fn events(&self) -> &[SynthEvent] {
        &self.events
    }

    /// Forgets recorded events, keeping live voices.
    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    /// Requests of every allocated voice, oldest first.
    pub fn allocations(&self) -> impl Iterator<Item = &VoiceRequest> {
        self.events.iter().filter_map(|event| match event {
            SynthEvent::Allocated(_, request) => Some(request),
            _ => None,
        })
    }

    /// Last parameters of a live voice.
    #[must_use]
    pub fn params(&self, voice: VoiceId) -> Option<VoiceParams> {
        self.live
            .iter()
            .find(|(id, _)| *id == voice)
            .map(|(_, params)| *params)
    }

    /// Live voices.
    pub fn live_voices(&self) -> impl Iterator<Item = VoiceId> + '_ {
        self.live.iter().map(|(id, _)| *id)
    }

    /// Number of parameter updates received.
    #[inline]
    #[must_use]
    pub const fn updates(&self) -> u64 {
        self.updates
    }

    /// Current reverb gain, starting at 1.
    #[inline]
    #[must_use]
    pub const fn reverb_gain(&self) -> f32 {
        self.reverb_gain
    }

    fn drop_voice(&mut self, voice: VoiceId) -> bool {
        match self.live.iter().position(|(id, _)| *id == voice) {
            Some(index) => {
                self.live.swap_remove(index);
                true
            }
            None => false,
        }
    }
}

impl Synthesizer for VoiceRecorder {
    fn configure(&mut self, preset: &SessionPreset) {
        self.limit = usize::from(preset.max_voices);
        self.live.clear();
        self.events.push(SynthEvent::Configured {
            frequency: preset.frequency,
            max_voices: preset.max_voices,
        });
    }

    fn allocate_voice(&mut self, request: &VoiceRequest) -> Option<VoiceId> {
        if self.live.len() >= self.limit {
            self.events.push(SynthEvent::Refused(*request));
            return None;
        }
        let voice = VoiceId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.live.push((voice, request.params));
        self.events.push(SynthEvent::Allocated(voice, *request));
        Some(voice)
    }

    fn update_voice(&mut self, voice: VoiceId, params: &VoiceParams) {
        if let Some((_, current)) = self.live.iter_mut().find(|(id, _)| *id == voice) {
            *current = *params;
            self.updates += 1;
        }
    }

    fn release_voice(&mut self, voice: VoiceId) {
        if self.drop_voice(voice) {
            self.events.push(SynthEvent::Released(voice));
        }
    }

    fn kill_voice(&mut self, voice: VoiceId) {
        if self.drop_voice(voice) {
            self.events.push(SynthEvent::Killed(voice));
        }
    }

    fn reserve_voices(&mut self, owner: VoiceOwner, count: u8) {
        self.events.push(SynthEvent::Reserved(owner, count));
    }

    fn fade_out(&mut self, ticks: u16) {
        self.events.push(SynthEvent::FadeOut(ticks));
    }

    fn mute(&mut self) {
        self.events.push(SynthEvent::Muted);
    }

    fn decrease_reverb_gain(&mut self) {
        self.reverb_gain -= self.reverb_gain / 8.0;
        self.events.push(SynthEvent::ReverbDecreased);
    }

    fn active_voices(&self) -> usize {
        self.live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> VoiceRequest {
        VoiceRequest {
            player: 0,
            channel: 0,
            layer: 0,
            source: VoiceSource::Wave(0x80),
            priority: 3,
            policy: 0,
            envelope: None,
            release_rate: 0x20,
            sustain: 0,
            params: VoiceParams::default(),
        }
    }

    #[test]
    fn test_recorder_respects_limit() {
        let mut synth = VoiceRecorder::new(1);
        let voice = synth.allocate_voice(&request()).unwrap();
        assert!(synth.allocate_voice(&request()).is_none());
        assert_eq!(synth.active_voices(), 1);

        synth.release_voice(voice);
        assert_eq!(synth.active_voices(), 0);
        assert!(matches!(synth.events()[1], SynthEvent::Refused(_)));
        assert_eq!(synth.events()[2], SynthEvent::Released(voice));
    }

    #[test]
    fn test_recorder_tracks_params_and_reverb() {
        let mut synth = VoiceRecorder::new(4);
        let voice = synth.allocate_voice(&request()).unwrap();
        let params = VoiceParams {
            frequency: 2.0,
            ..VoiceParams::default()
        };
        synth.update_voice(voice, &params);
        assert_eq!(synth.params(voice).unwrap().frequency, 2.0);
        assert_eq!(synth.updates(), 1);

        synth.decrease_reverb_gain();
        assert!((synth.reverb_gain() - 0.875).abs() < f32::EPSILON);
    }
}
