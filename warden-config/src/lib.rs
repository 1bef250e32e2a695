//! Layered YAML configuration for the warden agent.
//!
//! A [`ConfigStore`] parses the base document, overlays the per-group files
//! named by an installed group provider, and answers typed lookups from an
//! atomically swappable snapshot.

#![warn(missing_docs, clippy::pedantic)]

mod merge;
mod store;
mod time;

use thiserror::Error;

pub use store::{ConfigStore, FromConfigValue, GroupProvider};
pub use time::parse_time_millis;

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors surfaced by the configuration layer.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The supplied YAML document could not be parsed.
    #[error("error parsing yaml: {source}")]
    Parse {
        /// Source parser error.
        #[from]
        source: serde_yaml::Error,
    },

    /// A group overlay file could not be read or parsed; the current
    /// snapshot is left untouched.
    #[error("loading shared configuration for group `{group}` failed: {reason}")]
    Overlay {
        /// Group whose overlay failed.
        group: String,
        /// Human-readable reason.
        reason: String,
    },

    /// A configuration file could not be read.
    #[error("error reading configuration file {path}: {reason}")]
    Io {
        /// Path of the unreadable file.
        path: String,
        /// Human-readable reason.
        reason: String,
    },

    /// A duration-valued option carried a malformed magnitude or suffix.
    #[error("invalid time unit: {value}")]
    InvalidTimeUnit {
        /// The offending option text.
        value: String,
    },
}
