//! # Sequencer Benchmark
//!
//! Measures the paths the audio thread pays for every frame:
//! 1. A full engine tick with every player driving a looping layer
//! 2. Sample cache lookups that hit a resident slot
//! 3. A synchronous sequence load + player start
//!
//! Target: a tick with three busy players well under 10 microseconds.

#![allow(missing_docs)]

use cadence::{ArchiveBuilder, BankBuilder, Engine, RomDevice, SlotClass, VoiceRecorder};
use cadence_shared::EngineConfig;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

/// Player starts channel 0 with layer 0 looping note 39.
const LOOPING_NOTE: [u8; 29] = [
    0xd7, 0x00, 0x01, 0x90, 0x00, 12, 0xfd, 0x7f, 0xfb, 0x00, 6, 0xff, 0xc1, 0x00, 0x90, 0x00, 24,
    0xfd, 0x7f, 0xfb, 0x00, 17, 0xff, 0xff, 39, 8, 0xfb, 0x00, 24,
];

fn archive() -> ArchiveBuilder {
    let mut archive = ArchiveBuilder::new();
    archive.add_bank(
        BankBuilder::new()
            .sample(&[0x40; 0x400])
            .instrument(0, 1.0)
            .instrument(0, 2.0),
    );
    for _ in 0..3 {
        archive.add_sequence(&LOOPING_NOTE, &[0]);
    }
    archive
}

fn engine() -> Engine<RomDevice, VoiceRecorder> {
    Engine::initialize(
        EngineConfig::default(),
        RomDevice::new(archive().build(), 1),
        VoiceRecorder::new(16),
    )
    .expect("engine")
}

fn bench_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_tick");

    for players in [1u8, 3] {
        let mut engine = engine();
        for player in 0..players {
            engine.load_sequence(player, player, false).expect("load");
        }

        group.bench_with_input(BenchmarkId::new("players", players), &players, |b, _| {
            b.iter(|| {
                engine.tick();
                engine.synth_mut().clear_events();
                black_box(engine.ticks())
            });
        });
    }

    group.finish();
}

fn bench_cache_hit(c: &mut Criterion) {
    let mut engine = engine();
    let view = engine.fetch_sample(0x100, 0x40, SlotClass::LongLived).expect("fetch");
    for _ in 0..4 {
        engine.tick();
    }
    black_box(view);

    c.bench_function("sample_cache_hit", |b| {
        b.iter(|| black_box(engine.fetch_sample(black_box(0x100), 0x40, SlotClass::LongLived)));
    });
}

fn bench_sync_load(c: &mut Criterion) {
    let mut engine = engine();

    c.bench_function("sync_load_and_start", |b| {
        b.iter(|| {
            engine.load_sequence(0, black_box(1), false).expect("load");
            engine.disable_player(0).expect("disable");
        });
    });
}

criterion_group!(benches, bench_tick, bench_cache_hit, bench_sync_load);
criterion_main!(benches);
