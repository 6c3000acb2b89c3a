//! # Sequencer Script Tests
//!
//! Bytecode behaviour observed through the public engine surface.

mod common;

use cadence::{ArchiveBuilder, SynthEvent, Synthesizer, VoiceSource};
use cadence_core::{ContentKind, LoadStatus};
use common::{engine, looping_note_script, small_bank, tick_until};

/// Player prelude plus a channel that waits for host I/O port 3 to turn
/// non-negative before it starts its layer.
fn gated_script() -> Vec<u8> {
    vec![
        // 0: init channel 0, start it at 12; 6: player waits forever
        0xd7, 0x00, 0x01, 0x90, 0x00, 12, 0xfd, 0x7f, 0xfb, 0x00, 6, 0xff,
        // 12: instrument 0
        0xc1, 0x00,
        // 14: value = io[3]; 15: negative -> 26
        0x83, 0xf9, 0x00, 26,
        // 18: layer 0 at 32; 21: wait forever
        0x90, 0x00, 32, 0xfd, 0x7f, 0xfb, 0x00, 21,
        // 26: yield, poll again
        0xfe, 0xfb, 0x00, 14, 0xff, 0xff,
        // 32: layer: note 39 for 8 tatums, loop
        39, 8, 0xfb, 0x00, 32,
    ]
}

#[test]
fn test_host_io_gates_the_layer() {
    let mut archive = ArchiveBuilder::new();
    archive.add_bank(small_bank());
    archive.add_sequence(&gated_script(), &[0]);
    let mut engine = engine(&archive, 0);
    engine.load_sequence(0, 0, false).unwrap();

    assert_eq!(
        tick_until(&mut engine, 30, |e| e.synth().allocations().count() > 0),
        None
    );
    assert_eq!(engine.sequencer().active_layers(), 0);

    engine.set_channel_io(0, 0, 3, 5).unwrap();
    tick_until(&mut engine, 30, |e| e.synth().allocations().count() > 0).expect("layer starts");
    assert_eq!(engine.sequencer().channel(0, 0).unwrap().io(3), -1);
    assert!(engine.set_channel_io(0, 0, 8, 1).is_err());
}

#[test]
fn test_end_of_script_finishes_player() {
    let mut archive = ArchiveBuilder::new();
    archive.add_bank(small_bank());
    archive.add_sequence(&[0xff], &[0]);
    let mut engine = engine(&archive, 0);
    engine.load_sequence(0, 0, false).unwrap();

    tick_until(&mut engine, 30, |e| !e.player_state(0).unwrap().enabled).expect("player ends");
    let state = engine.player_state(0).unwrap();
    assert!(state.finished);
    assert_eq!(engine.load_status(ContentKind::Sequence, 0), LoadStatus::Discardable);
}

#[test]
fn test_fade_out_stops_player_and_voices() {
    let mut script = looping_note_script();
    // Replace the player's idle loop with a 6 tick fade-out and a long delay.
    script[6..12].copy_from_slice(&[0xda, 2, 0, 6, 0xfd, 0x7f]);
    let mut archive = ArchiveBuilder::new();
    archive.add_bank(small_bank());
    archive.add_sequence(&script, &[0]);
    let mut engine = engine(&archive, 0);
    engine.load_sequence(0, 0, false).unwrap();

    let ticks = tick_until(&mut engine, 100, |e| !e.player_state(0).unwrap().enabled)
        .expect("fade completes");
    assert!(ticks >= 6);
    assert_eq!(engine.synth().active_voices(), 0);
    assert_eq!(engine.sequencer().active_channels(), 0);
}

#[test]
fn test_looping_layer_releases_and_retriggers() {
    let mut archive = ArchiveBuilder::new();
    archive.add_bank(small_bank());
    archive.add_sequence(&looping_note_script(), &[0]);
    let mut engine = engine(&archive, 0);
    engine.load_sequence(0, 0, false).unwrap();

    tick_until(&mut engine, 100, |e| e.synth().active_voices() > 0).expect("note plays");
    let request = *engine.synth().allocations().next().unwrap();
    assert!(matches!(request.source, VoiceSource::Sample { bank: 0, .. }));
    assert_eq!((request.player, request.channel, request.layer), (0, 0, 0));
    assert!(request.params.frequency > 0.0);

    // The note is released after its duration and restarted by the loop.
    tick_until(&mut engine, 100, |e| {
        e.synth()
            .events()
            .iter()
            .any(|event| matches!(event, SynthEvent::Released(_)))
    })
    .expect("note releases");
    tick_until(&mut engine, 100, |e| e.synth().allocations().count() >= 2).expect("note repeats");
}
