//! # Sequence Runner
//!
//! Plays a generated demo archive through the engine in real time and
//! reports frame timing, cache traffic and pool state.
//!
//! Usage: `sequence_runner [config.toml] [frames]`
//!
//! Player 0 plays synchronously, player 1 streams its bank, player 2 is
//! started from a control thread. Halfway through, a session reset to the
//! last preset is requested the same way.

use std::thread;
use std::time::Instant;

use cadence::{ArchiveBuilder, BankBuilder, Engine, RomDevice, SlotClass, TickLoop, VoiceRecorder};
use cadence_core::{ContentKind, LoadStatus};
use cadence_shared::EngineConfig;

/// Frames run when none are given.
const DEFAULT_FRAMES: u64 = 240;
/// Device latency in service calls.
const DEVICE_LATENCY: u32 = 2;

/// Player prelude starting channel 0 with layer 0 looping `note`.
fn looping_script(note: u8, tatums: u8) -> Vec<u8> {
    vec![
        0xd7, 0x00, 0x01, 0x90, 0x00, 12, 0xfd, 0x7f, 0xfb, 0x00, 6, 0xff, 0xc1, 0x00, 0x90, 0x00,
        24, 0xfd, 0x7f, 0xfb, 0x00, 17, 0xff, 0xff, note, tatums, 0xfb, 0x00, 24,
    ]
}

fn demo_archive() -> ArchiveBuilder {
    let mut archive = ArchiveBuilder::new();
    archive.add_bank(
        BankBuilder::new()
            .sample(&[0x30; 0x200])
            .instrument(0, 1.0)
            .drum(0, 1.5, 64),
    );
    // Enough instruments to need several streaming chunks.
    archive.add_bank((0..160u8).fold(BankBuilder::new().sample(&[0x50; 0x400]), |bank, i| {
        bank.instrument(0, 1.0 + f32::from(i % 12) / 12.0)
    }));
    archive.add_sequence(&looping_script(39, 8), &[0]);
    archive.add_sequence(&looping_script(27, 12), &[1]);
    archive.add_sequence(&looping_script(44, 6), &[0]);
    archive
}

fn status_name(status: LoadStatus) -> &'static str {
    match status {
        LoadStatus::NotLoaded => "not loaded",
        LoadStatus::InProgress => "streaming",
        LoadStatus::Complete => "complete",
        LoadStatus::Discardable => "discardable",
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    let frames = args.next().and_then(|text| text.parse().ok()).unwrap_or(DEFAULT_FRAMES);

    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║           CADENCE SEQUENCE RUNNER                                ║");
    println!("║           Archive → Loader → Sequencer → Voices                  ║");
    println!("╠══════════════════════════════════════════════════════════════════╣");
    println!("║  TARGET: every frame inside its budget                           ║");
    println!("╚══════════════════════════════════════════════════════════════════╝");
    println!();

    let last_preset = u8::try_from(config.presets.len().saturating_sub(1)).unwrap_or(0);
    let preset = config.preset(0).cloned().unwrap_or_default();
    let mut tick_loop = TickLoop::for_preset(&config, &preset);
    let max_voices = usize::from(preset.max_voices);
    let mut engine = Engine::initialize(
        config,
        RomDevice::new(demo_archive().build(), DEVICE_LATENCY),
        VoiceRecorder::new(max_voices),
    )?;

    engine.load_sequence(0, 0, false)?;
    engine.load_sequence(1, 1, true)?;
    let board = engine.status_board();
    let control = engine.control_handle();
    let starter = thread::spawn(move || control.load_sequence(2, 2, false));

    println!("Running {frames} frames at {} ticks per frame...", tick_loop.ticks_per_frame());
    let start = Instant::now();
    while tick_loop.frame_count() < frames {
        tick_loop.wait_for_next_frame();
        while tick_loop.should_run() && tick_loop.frame_count() < frames {
            tick_loop.run_frame(&mut engine);
            if tick_loop.frame_count() == frames / 2 {
                engine.control_handle().reset_session(last_preset)?;
            }
            // Touch a sample window every frame, like a voice streaming its loop.
            let _ = engine.fetch_sample(0x100, 0x80, SlotClass::ShortLived);
            engine.synth_mut().clear_events();
        }
    }
    let elapsed = start.elapsed();
    starter.join().map_err(|_| "control thread panicked")??;

    let status = board.snapshot();
    let stats = tick_loop.stats();

    println!();
    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║                    SEQUENCE RUNNER RESULTS                       ║");
    println!("╚══════════════════════════════════════════════════════════════════╝");
    println!();
    println!("┌─ TIMING ───────────────────────────────────────────────────────┐");
    println!("│ Wall Time:          {:.2}s", elapsed.as_secs_f64());
    println!("│ Frames:             {}", stats.total_frames);
    println!("│ Engine Ticks:       {}", status.tick);
    println!("│ Frame Min/Avg/Max:  {} / {} / {} us", stats.min_frame_us, stats.avg_frame_us, stats.max_frame_us);
    println!("│ Late Frames:        {}", stats.late_frames);
    println!("└──────────────────────────────────────────────────────────────────┘");
    println!();
    println!("┌─ SESSION ──────────────────────────────────────────────────────┐");
    println!("│ Preset:             {}", status.preset);
    println!("│ Reset Phase:        {:?}", status.reset);
    println!("│ Pending Jobs:       {}", status.pending_jobs);
    println!("│ Active Voices:      {}", status.active_voices);
    println!("│ Cache Hits/Misses:  {} / {}", status.cache_hits, status.cache_misses);
    println!("└──────────────────────────────────────────────────────────────────┘");
    println!();
    println!("┌─ CONTENT ──────────────────────────────────────────────────────┐");
    for id in 0..3u8 {
        println!(
            "│ Sequence {id}:         {}",
            status_name(status.load_status(ContentKind::Sequence, id))
        );
    }
    for id in 0..2u8 {
        println!(
            "│ Bank {id}:             {}",
            status_name(status.load_status(ContentKind::Bank, id))
        );
    }
    for (index, player) in status.players.iter().enumerate() {
        match player {
            Some(state) if state.enabled => println!(
                "│ Player {index}:           seq {} tempo {} fade {:.2}",
                state.seq_id, state.tempo, state.fade_volume
            ),
            _ => println!("│ Player {index}:           idle"),
        }
    }
    println!("└──────────────────────────────────────────────────────────────────┘");
    println!();

    if stats.late_frames == 0 {
        println!("✓ Every frame finished inside its budget");
    } else {
        println!("✗ {} frames overran their budget", stats.late_frames);
    }
    Ok(())
}
