//! # Configuration Error Types

use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read configuration {path}: {reason}")]
    Io {
        /// Path that was read.
        path: String,
        /// OS error text.
        reason: String,
    },

    /// The TOML text did not parse into a configuration.
    #[error("invalid configuration syntax: {0}")]
    Parse(String),

    /// The configuration could not be written back to TOML.
    #[error("cannot serialise configuration: {0}")]
    Serialise(String),

    /// A value is out of its allowed range.
    #[error("invalid configuration value `{field}`: {reason}")]
    InvalidValue {
        /// Offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
