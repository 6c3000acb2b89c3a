//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use cadence::{ArchiveBuilder, BankBuilder, Engine, RomDevice, VoiceRecorder};
use cadence_shared::{EngineConfig, SessionPreset};

/// Engine under test.
pub type TestEngine = Engine<RomDevice, VoiceRecorder>;

/// Small heap with a tight bank pool: no persistent bank memory, so every
/// bank lands on a temporary side.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        heap_size: 0x20000,
        init_pool_size: 0x1000,
        players: 3,
        channels: 16,
        layers: 16,
        reset_drain_ms: 100,
        presets: vec![
            SessionPreset {
                max_voices: 4,
                persistent_seq_mem: 0x800,
                temporary_seq_mem: 0x1000,
                persistent_bank_mem: 0,
                temporary_bank_mem: 0x4000,
                ..SessionPreset::default()
            },
            SessionPreset {
                frequency: 22_050,
                max_voices: 8,
                persistent_seq_mem: 0x800,
                temporary_seq_mem: 0x1000,
                persistent_bank_mem: 0x2000,
                temporary_bank_mem: 0x4000,
                ..SessionPreset::default()
            },
        ],
        ..EngineConfig::default()
    }
}

/// A bank whose instrument table needs two streaming chunks.
pub fn streaming_bank() -> BankBuilder {
    (0..150).fold(BankBuilder::new().sample(&[0x11; 0x100]), |bank, _| {
        bank.instrument(0, 1.0)
    })
}

/// A bank small enough for one chunk.
pub fn small_bank() -> BankBuilder {
    BankBuilder::new().sample(&[0x22; 0x40]).instrument(0, 1.0)
}

/// Player starts channel 0, which selects instrument 0 and keeps layer 0
/// playing note 39 in a loop.
pub fn looping_note_script() -> Vec<u8> {
    vec![
        // 0: init channel 0, start it at 12
        0xd7, 0x00, 0x01, 0x90, 0x00, 12,
        // 6: player waits forever
        0xfd, 0x7f, 0xfb, 0x00, 6, 0xff,
        // 12: channel: instrument 0, layer 0 at 24, wait forever
        0xc1, 0x00, 0x90, 0x00, 24, 0xfd, 0x7f, 0xfb, 0x00, 17, 0xff, 0xff,
        // 24: layer: note 39 for 8 tatums, then loop
        39, 8, 0xfb, 0x00, 24,
    ]
}

/// Starts an engine over `archive` with async transfers landing after
/// `latency` service calls.
pub fn engine(archive: &ArchiveBuilder, latency: u32) -> TestEngine {
    Engine::initialize(test_config(), RomDevice::new(archive.build(), latency), VoiceRecorder::new(8))
        .expect("engine starts")
}

/// Ticks until `done` holds, returning the ticks it took.
pub fn tick_until(engine: &mut TestEngine, limit: usize, mut done: impl FnMut(&TestEngine) -> bool) -> Option<usize> {
    for tick in 1..=limit {
        engine.tick();
        if done(engine) {
            return Some(tick);
        }
    }
    None
}
