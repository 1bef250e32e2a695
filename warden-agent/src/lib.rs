//! Warden endpoint agent.
//!
//! This crate wires the runtime crates into a working agent: the
//! [`Agent`] orchestrator owns the task manager, the durable queue, the
//! communicator and the module manager, and drives startup, command
//! dispatch and orderly shutdown. The subsystem crates are re-exported for
//! embedders.

#![warn(missing_docs, clippy::pedantic)]

mod agent;
mod agent_info;
mod centralized;
mod queue_utils;

/// Shared data model.
pub use warden_primitives as primitives;

/// Layered YAML configuration store.
pub use warden_config as config;

/// Durable multi-type queue.
pub use warden_queue as queue;

/// Manager-facing HTTP layer.
pub use warden_comms as comms;

/// Signal bus, task manager, modules and command dispatch.
pub use warden_kernel as kernel;

pub use agent::{Agent, AgentBuilder, AgentStatus, RELOAD_SIGNAL, SHUTDOWN_SIGNAL};
pub use agent_info::{default_state_dir, AgentInfo};
pub use centralized::CentralizedConfiguration;
pub use queue_utils::{
    get_command_from_queue, get_messages_from_queue, push_commands_to_queue,
    report_command_result,
};

use thiserror::Error;

/// Result alias for agent assembly and runtime operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors surfaced while assembling or running the agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Queue storage failure.
    #[error(transparent)]
    Queue(#[from] warden_queue::QueueError),

    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] warden_config::ConfigError),

    /// Identity store failure.
    #[error("identity store error: {reason}")]
    Identity {
        /// Human-readable context.
        reason: String,
    },

    /// Filesystem failure outside the queue and identity stores.
    #[error("i/o error: {source}")]
    Io {
        /// Source [`std::io::Error`].
        #[from]
        source: std::io::Error,
    },
}
