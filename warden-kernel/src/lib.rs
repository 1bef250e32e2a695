//! Runtime kernel for the warden agent.
//!
//! This crate provides the in-process plumbing the orchestrator wires
//! together: a named signal bus, a bounded task manager backed by `tokio`,
//! the module capability surface with its manager, and the command
//! processing loop.

#![warn(missing_docs, clippy::pedantic)]

mod commands;
mod module;
mod signal;
mod tasks;

pub use commands::{
    commands_processing_task, execute_with_deadline, unknown_module_result, DispatchFn,
    GetCommandFn, PopCommandFn, ReportResultFn, DEFAULT_COMMAND_TIMEOUT,
};
pub use module::{
    Module, ModuleError, ModuleManager, ModuleResult, PushMessageFn, PUSH_MESSAGE_OK,
};
pub use signal::{SignalDispatcher, SignalHandle};
pub use tasks::{TaskManager, TaskManagerConfig};

use thiserror::Error;

/// Result alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

/// Errors emitted by the kernel plumbing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KernelError {
    /// A module with the same name is already registered.
    #[error("module `{0}` is already registered")]
    DuplicateModule(String),

    /// The task manager no longer accepts submissions.
    #[error("task manager closed")]
    Closed,
}
