//! # Cadence - Real-Time Sequenced Audio Engine
//!
//! Fixed-memory audio engine that streams instrument banks and sequence
//! bytecode from a slow device and interprets the bytecode every tick.
//!
//! ## Architecture
//!
//! - **Transfer**: blocking and asynchronous copies from a device, plus a
//!   TTL-managed cache of small sample windows
//! - **Loader**: synchronous and chunked streaming loads into the
//!   persistent / two-sided temporary pools, with bank relocation
//! - **Sequencer**: player / channel / layer interpreters driving voices on
//!   a [`Synthesizer`]
//! - **Session**: cooperative reset that rebuilds every pool for a preset
//! - **Engine**: the facade a host ticks, with a control channel and a
//!   status board for other threads
//!
//! ## Performance Guarantees
//!
//! - No heap allocation in the tick path
//! - Only the synchronous load path blocks on the device
//! - A fault disables the unit that hit it, never the engine
//!
//! ## Example
//!
//! ```rust,ignore
//! use cadence::{Engine, RomDevice, VoiceRecorder};
//! use cadence_shared::EngineConfig;
//!
//! let mut engine = Engine::initialize(EngineConfig::default(), RomDevice::new(image, 1), VoiceRecorder::new(16))?;
//! engine.load_sequence(0, 3, true)?;
//! loop {
//!     engine.tick();
//! }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod builder;
pub mod control;
pub mod engine;
pub mod error;
pub mod loader;
pub mod sequencer;
pub mod session;
pub mod synth;
pub mod tick;
pub mod transfer;

pub use builder::{ArchiveBuilder, BankBuilder};
pub use control::{ControlCommand, ControlHandle, EngineStatus, PreloadMask, StatusBoard};
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use loader::{ArchiveIndex, Loader, SessionPools};
pub use sequencer::{PlayerState, Sequencer, VoiceParams};
pub use session::{ResetPhase, SessionReset};
pub use synth::{SynthEvent, Synthesizer, VoiceId, VoiceOwner, VoiceRecorder, VoiceRequest, VoiceSource};
pub use tick::{FrameStats, TickLoop};
pub use transfer::{
    CompletionQueue, DeviceAddr, RomDevice, SampleCache, SampleView, SlotClass, TransferDevice,
};
