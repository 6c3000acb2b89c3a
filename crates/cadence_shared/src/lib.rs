//! # Cadence Shared
//!
//! Types shared by the audio engine and the tools that build its archives.
//!
//! ## CRITICAL RULE
//!
//! This crate holds definitions only: constants, configuration, tables and
//! the archive wire format. Runtime state belongs in `cadence_core` or
//! `cadence`.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod archive;
pub mod config;
pub mod constants;
pub mod error;
pub mod tables;

pub use archive::{
    ArchiveHeader, BankHeader, BankSet, DirectoryEntry, DirectoryHeader, DrumRecord,
    EnvelopePoint, InstrumentRecord, SampleRecord, SoundRecord,
};
pub use config::{EngineConfig, SessionPreset};
pub use error::{ConfigError, ConfigResult};
pub use tables::TuningTables;
