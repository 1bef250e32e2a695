//! Shared error definitions for the agent data model.

use thiserror::Error;

/// Result alias used throughout the agent runtime.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while manipulating the shared data model.
#[derive(Debug, Error)]
pub enum Error {
    /// A command entry payload was missing a required field or carried a
    /// field of the wrong shape.
    #[error("invalid command entry: {reason}")]
    InvalidCommandEntry {
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// An identity field failed validation.
    #[error("invalid agent identity: {reason}")]
    InvalidIdentity {
        /// Human-readable reason for rejection.
        reason: String,
    },
}

impl Error {
    /// Convenience constructor for command entry failures.
    #[must_use]
    pub fn invalid_command_entry(reason: impl Into<String>) -> Self {
        Self::InvalidCommandEntry {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for identity failures.
    #[must_use]
    pub fn invalid_identity(reason: impl Into<String>) -> Self {
        Self::InvalidIdentity {
            reason: reason.into(),
        }
    }
}
