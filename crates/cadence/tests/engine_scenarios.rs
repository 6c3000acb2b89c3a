//! # Engine Scenario Tests
//!
//! End-to-end behaviour of the engine over an in-memory archive: streaming
//! loads, two-sided bank placement, player teardown, faults, session resets
//! and the sample cache.

mod common;

use cadence::{
    ArchiveBuilder, ControlCommand, EngineError, PreloadMask, ResetPhase, SlotClass, SynthEvent,
    Synthesizer, TransferDevice, VoiceSource,
};
use cadence_core::{ContentKind, LoadStatus, Side};
use common::{engine, looping_note_script, small_bank, streaming_bank, tick_until};

const IDLE_SCRIPT: [u8; 5] = [0xfd, 0x7f, 0xfb, 0x00, 0x00];

/// Test: seq 5 needs bank 3, nothing is loaded and both bank sides are
/// empty. The bank streams into the front side and the sequence starts once
/// it lands.
#[test]
fn test_streamed_bank_lands_in_front_then_sequence_runs() {
    let mut archive = ArchiveBuilder::new();
    for _ in 0..3 {
        archive.add_bank(small_bank());
    }
    assert_eq!(archive.add_bank(streaming_bank()), 3);
    for _ in 0..5 {
        archive.add_sequence(&IDLE_SCRIPT, &[0]);
    }
    assert_eq!(archive.add_sequence(&looping_note_script(), &[3]), 5);

    let mut engine = engine(&archive, 1);
    assert_eq!(engine.load_status(ContentKind::Bank, 3), LoadStatus::NotLoaded);

    engine.load_sequence(0, 5, true).unwrap();
    assert_eq!(engine.load_status(ContentKind::Bank, 3), LoadStatus::InProgress);
    assert_eq!(
        engine.loader().temporary_side(ContentKind::Bank, 3),
        Some(Side::Front)
    );

    let mut streaming_ticks = 0;
    while engine.load_status(ContentKind::Bank, 3) == LoadStatus::InProgress {
        assert_eq!(engine.synth().allocations().count(), 0, "player ran before its bank");
        engine.tick();
        streaming_ticks += 1;
        assert!(streaming_ticks < 50, "bank never finished streaming");
    }
    // Two chunks, each waiting out the device latency.
    assert!(streaming_ticks >= 2);
    assert_eq!(engine.load_status(ContentKind::Bank, 3), LoadStatus::Complete);

    tick_until(&mut engine, 100, |e| e.synth().active_voices() > 0).expect("note plays");
    let request = engine.synth().allocations().next().copied().unwrap();
    assert!(matches!(request.source, VoiceSource::Sample { bank: 3, .. }));
    assert_eq!(request.player, 0);
}

/// Test: two sequences with two different never-loaded banks, loaded back
/// to back: the first bank claims the front side, the second the back.
#[test]
fn test_back_to_back_banks_take_both_sides() {
    let mut archive = ArchiveBuilder::new();
    archive.add_bank(streaming_bank());
    archive.add_bank(streaming_bank());
    archive.add_sequence(&looping_note_script(), &[0]);
    archive.add_sequence(&looping_note_script(), &[1]);

    let mut engine = engine(&archive, 0);
    engine.load_sequence(0, 0, true).unwrap();
    engine.load_sequence(1, 1, true).unwrap();

    assert_eq!(engine.loader().temporary_side(ContentKind::Bank, 0), Some(Side::Front));
    assert_eq!(engine.loader().temporary_side(ContentKind::Bank, 1), Some(Side::Back));

    tick_until(&mut engine, 100, |e| {
        e.load_status(ContentKind::Bank, 0).is_loaded() && e.load_status(ContentKind::Bank, 1).is_loaded()
    })
    .expect("both banks stream in");
    let played = |e: &common::TestEngine, bank: u8| {
        e.synth()
            .allocations()
            .any(|request| matches!(request.source, VoiceSource::Sample { bank: b, .. } if b == bank))
    };
    tick_until(&mut engine, 100, |e| played(e, 0) && played(e, 1)).expect("both players play");
}

/// Test: disabling a running player stops its channels and layers at once
/// and leaves its content resident but discardable.
#[test]
fn test_disable_player_cascades_and_marks_discardable() {
    let mut archive = ArchiveBuilder::new();
    archive.add_bank(small_bank());
    archive.add_sequence(&looping_note_script(), &[0]);

    let mut engine = engine(&archive, 0);
    engine.load_sequence(0, 0, false).unwrap();
    tick_until(&mut engine, 100, |e| e.synth().active_voices() > 0).expect("note plays");
    assert!(engine.sequencer().active_layers() > 0);

    engine.disable_player(0).unwrap();

    let state = engine.player_state(0).unwrap();
    assert!(!state.enabled);
    assert_eq!(engine.sequencer().active_channels(), 0);
    assert_eq!(engine.sequencer().active_layers(), 0);
    assert_eq!(engine.synth().active_voices(), 0);
    assert_eq!(engine.load_status(ContentKind::Sequence, 0), LoadStatus::Discardable);
    assert_eq!(engine.load_status(ContentKind::Bank, 0), LoadStatus::Discardable);
    assert_eq!(engine.loader().temporary_side(ContentKind::Bank, 0), Some(Side::Front));
}

/// Test: a script that calls itself forever overflows the call stack; its
/// player is disabled and everything else keeps running.
#[test]
fn test_call_overflow_disables_only_the_faulting_player() {
    let mut archive = ArchiveBuilder::new();
    archive.add_bank(small_bank());
    archive.add_sequence(&looping_note_script(), &[0]);
    archive.add_sequence(&[0xfc, 0x00, 0x00], &[0]);

    let mut engine = engine(&archive, 0);
    engine.load_sequence(0, 0, false).unwrap();
    engine.load_sequence(1, 1, false).unwrap();

    tick_until(&mut engine, 100, |e| !e.player_state(1).unwrap().enabled).expect("faulting player stops");
    assert!(engine.player_state(0).unwrap().enabled);
    tick_until(&mut engine, 100, |e| e.synth().active_voices() > 0).expect("healthy player plays");

    let before = engine.ticks();
    engine.tick();
    assert_eq!(engine.ticks(), before + 1);
}

/// Test: a session reset finishes within its drain bound even when a
/// transfer never completes, and the engine is usable afterwards.
#[test]
fn test_reset_completes_with_stuck_transfer() {
    let mut archive = ArchiveBuilder::new();
    archive.add_bank(streaming_bank());
    archive.add_bank(small_bank());
    archive.add_sequence(&looping_note_script(), &[0]);
    archive.add_sequence(&looping_note_script(), &[1]);

    let mut engine = engine(&archive, 0);
    engine.device_mut().set_stalled(true);
    engine.load_sequence(0, 0, true).unwrap();
    assert_eq!(engine.device().in_flight(), 1);

    let board = engine.status_board();
    engine.reset_session(1).unwrap();
    assert_eq!(engine.reset_session(0), Err(EngineError::ResetInProgress));

    engine.tick();
    assert_ne!(board.reset_phase(), ResetPhase::Idle);
    assert_eq!(engine.load_sequence(1, 1, false), Err(EngineError::ResetInProgress));

    let preset = engine.config().presets[1].clone();
    let bound = engine.config().reset_drain_ticks(&preset) as usize;
    let ticks = tick_until(&mut engine, bound + 64, |e| e.reset_phase() == ResetPhase::Idle)
        .expect("reset finishes");
    assert!(ticks <= bound + 32);

    assert_eq!(engine.preset(), 1);
    assert_eq!(board.reset_phase(), ResetPhase::Idle);
    assert_eq!(engine.device().in_flight(), 1);
    assert_eq!(engine.load_status(ContentKind::Bank, 0), LoadStatus::NotLoaded);
    assert!(!engine.player_state(0).unwrap().enabled);
    assert_eq!(engine.loader().pending_jobs(), 0);

    engine.load_sequence(1, 1, false).unwrap();
    tick_until(&mut engine, 100, |e| e.synth().active_voices() > 0).expect("new session plays");
}

/// Test: the reset walks its teardown steps in order.
#[test]
fn test_reset_steps_reach_the_synthesizer() {
    let mut archive = ArchiveBuilder::new();
    archive.add_bank(small_bank());
    archive.add_sequence(&looping_note_script(), &[0]);

    let mut engine = engine(&archive, 0);
    engine.load_sequence(0, 0, false).unwrap();
    tick_until(&mut engine, 100, |e| e.synth().active_voices() > 0).expect("note plays");
    engine.synth_mut().clear_events();

    engine.reset_session(0).unwrap();
    tick_until(&mut engine, 200, |e| e.reset_phase() == ResetPhase::Idle).expect("reset finishes");

    let events = engine.synth().events();
    let position = |wanted: &SynthEvent| events.iter().position(|event| event == wanted);
    let first_reverb = position(&SynthEvent::ReverbDecreased).expect("reverb lowered");
    let fade = position(&SynthEvent::FadeOut(16)).expect("voices released");
    let muted = position(&SynthEvent::Muted).expect("output muted");
    assert!(first_reverb < fade && fade < muted);
    assert_eq!(
        events.iter().filter(|e| **e == SynthEvent::ReverbDecreased).count(),
        4
    );
    assert!(matches!(events.last(), Some(SynthEvent::Configured { .. })));
    assert_eq!(engine.synth().active_voices(), 0);
    assert!(!engine.player_state(0).unwrap().enabled);
}

/// Test: a window inside a cached slot is served without a new transfer.
#[test]
fn test_sample_cache_hit_inside_slot() {
    let mut archive = ArchiveBuilder::new();
    archive.add_bank(small_bank());
    archive.add_sequence(&IDLE_SCRIPT, &[0]);
    let mut engine = engine(&archive, 0);

    let first = engine.fetch_sample(0x100, 4, SlotClass::LongLived).unwrap();
    let submitted = engine.device().submitted();
    let second = engine.fetch_sample(0x102, 4, SlotClass::LongLived).unwrap();

    assert_eq!(first.slot, second.slot);
    assert_eq!(second.offset, first.offset + 2);
    assert_eq!(engine.device().submitted(), submitted);
    assert_eq!(engine.cache().hits(), 1);
    assert_eq!(engine.cache().misses(), 1);
}

/// Test: a short-lived slot is back in the reuse queue exactly two ticks
/// after its last use.
#[test]
fn test_short_lived_slot_expires_after_two_ticks() {
    let mut archive = ArchiveBuilder::new();
    archive.add_bank(small_bank());
    archive.add_sequence(&IDLE_SCRIPT, &[0]);
    let mut engine = engine(&archive, 0);

    engine.fetch_sample(0x40, 16, SlotClass::ShortLived).unwrap();
    let reusable = engine.cache().reusable(SlotClass::ShortLived);

    engine.tick();
    assert_eq!(engine.cache().reusable(SlotClass::ShortLived), reusable);
    engine.tick();
    assert_eq!(engine.cache().reusable(SlotClass::ShortLived), reusable + 1);
}

/// Test: fetched sample bytes match the archive once the transfer lands.
#[test]
fn test_fetched_sample_bytes_land_after_service() {
    let mut archive = ArchiveBuilder::new();
    archive.add_bank(small_bank());
    archive.add_sequence(&IDLE_SCRIPT, &[0]);
    let image = archive.build();
    let mut engine = engine(&archive, 0);

    let view = engine.fetch_sample(0x20, 8, SlotClass::LongLived).unwrap();
    engine.tick();
    assert_eq!(engine.sample_bytes(&view), &image[0x20..0x28]);
}

/// Test: a player whose previous stream is still in flight refuses a new
/// load; a bank streaming for one player is refused to another.
#[test]
fn test_overlapping_streams_are_refused() {
    let mut archive = ArchiveBuilder::new();
    archive.add_bank(streaming_bank());
    archive.add_sequence(&looping_note_script(), &[0]);
    archive.add_sequence(&looping_note_script(), &[0]);

    let mut engine = engine(&archive, 10);
    engine.load_sequence(0, 0, true).unwrap();

    assert!(matches!(
        engine.load_sequence(0, 1, true),
        Err(EngineError::LoadFailure {
            kind: ContentKind::Sequence,
            ..
        })
    ));
    assert_eq!(
        engine.load_sequence(1, 1, true),
        Err(EngineError::LoadFailure {
            kind: ContentKind::Bank,
            id: 0,
            reason: "bank already streaming",
        })
    );
    assert_eq!(
        engine.load_sequence(2, 1, false),
        Err(EngineError::LoadFailure {
            kind: ContentKind::Bank,
            id: 0,
            reason: "bank already streaming",
        })
    );
}

/// Test: preloading brings content in without starting a player.
#[test]
fn test_preload_by_mask() {
    let mut archive = ArchiveBuilder::new();
    archive.add_bank(small_bank());
    archive.add_sequence(&looping_note_script(), &[0]);
    let mut engine = engine(&archive, 0);

    engine.preload_sequence(0, PreloadMask::BANKS).unwrap();
    assert!(engine.load_status(ContentKind::Bank, 0).is_loaded());
    assert_eq!(engine.load_status(ContentKind::Sequence, 0), LoadStatus::NotLoaded);

    engine.preload_sequence(0, PreloadMask::SEQUENCE).unwrap();
    assert!(engine.load_status(ContentKind::Sequence, 0).is_loaded());
    assert!(!engine.player_state(0).unwrap().enabled);

    assert!(matches!(
        engine.preload_sequence(9, PreloadMask::all()),
        Err(EngineError::MissingContent { .. })
    ));
}

/// Test: host threads drive the engine through the control handle and read
/// the result from the status board.
#[test]
fn test_control_from_another_thread() {
    let mut archive = ArchiveBuilder::new();
    archive.add_bank(small_bank());
    archive.add_sequence(&looping_note_script(), &[0]);
    let mut engine = engine(&archive, 0);

    let handle = engine.control_handle();
    let board = engine.status_board();
    std::thread::spawn(move || {
        handle.load_sequence(2, 0, false).unwrap();
        handle
            .send(ControlCommand::SetChannelIo {
                player: 2,
                channel: 0,
                port: 3,
                value: 9,
            })
            .unwrap();
    })
    .join()
    .unwrap();

    engine.tick();
    engine.tick();

    let status = board.snapshot();
    assert_eq!(status.tick, 2);
    assert_eq!(status.load_status(ContentKind::Sequence, 0), LoadStatus::Complete);
    assert!(board.player(2).unwrap().enabled);
    assert!(board.generation() >= 2);
}

/// Test: after a reset to a preset with persistent bank memory, banks land
/// in the persistent tier instead of a temporary side.
#[test]
fn test_reset_switches_pool_layout() {
    let mut archive = ArchiveBuilder::new();
    archive.add_bank(small_bank());
    archive.add_sequence(&looping_note_script(), &[0]);
    let mut engine = engine(&archive, 0);

    engine.reset_session(1).unwrap();
    tick_until(&mut engine, 200, |e| e.reset_phase() == ResetPhase::Idle).expect("reset finishes");

    engine.load_sequence(0, 0, false).unwrap();
    assert!(engine.load_status(ContentKind::Bank, 0).is_loaded());
    assert_eq!(engine.loader().temporary_side(ContentKind::Bank, 0), None);
    assert_eq!(engine.cache().slot_count(), 8 * 3 + 8);
}
