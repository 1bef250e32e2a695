//! Durable multi-type message queue.
//!
//! Messages are kept in one append-only log per [`MessageType`]; pushes are
//! flushed to disk before they become visible, pops append acknowledgement
//! records, and replaying a log on open rebuilds exactly the pending set.
//! Anything delivered but never popped is delivered again after a restart.
//!
//! [`MessageType`]: warden_primitives::MessageType

#![warn(missing_docs, clippy::pedantic)]

mod queue;
mod store;

use thiserror::Error;

pub use queue::MultiTypeQueue;

/// Result alias for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors emitted by the persistent queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Underlying I/O failure while reading or writing a queue log.
    #[error("queue i/o error: {source}")]
    Io {
        /// Source [`std::io::Error`].
        #[from]
        source: std::io::Error,
    },

    /// A record could not be encoded or decoded.
    #[error("queue serialization error: {source}")]
    Serialization {
        /// Source [`serde_json::Error`].
        #[from]
        source: serde_json::Error,
    },
}
