//! Shared data model for the warden agent runtime.
//!
//! This crate defines the types that cross subsystem boundaries: queued
//! [`Message`]s, server-issued [`CommandEntry`]s and their execution results,
//! and the host [`AgentIdentity`].

#![warn(missing_docs, clippy::pedantic)]

mod command;
mod error;
mod identity;
mod message;

pub use command::{CommandEntry, CommandResult, CommandStatus};
pub use error::{Error, Result};
pub use identity::AgentIdentity;
pub use message::{Message, MessageType};
