//! Command processing loop and dispatch helpers.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use warden_primitives::{CommandEntry, CommandResult, CommandStatus};

use crate::module::ModuleResult;

/// Deadline applied to a command when the configuration does not override
/// it.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Sleep between ticks when the command queue is empty.
const EMPTY_QUEUE_TICK: Duration = Duration::from_secs(1);

/// Pulls the next command, resolving to `None` when the queue is empty.
pub type GetCommandFn = Box<dyn FnMut() -> BoxFuture<'static, Option<CommandEntry>> + Send>;

/// Removes the in-flight command from the queue.
pub type PopCommandFn = Box<dyn FnMut() -> BoxFuture<'static, ()> + Send>;

/// Enqueues the terminal entry as a command result.
pub type ReportResultFn = Box<dyn FnMut(CommandEntry) -> BoxFuture<'static, ()> + Send>;

/// Resolves the target and executes the command, returning the terminal
/// entry.
pub type DispatchFn = Box<dyn FnMut(CommandEntry) -> BoxFuture<'static, CommandEntry> + Send>;

/// Drives command dispatch until `keep_running` is cleared.
///
/// Each tick pulls one command; an empty queue sleeps for a second. A
/// dispatched command has its terminal entry reported as a command result
/// before the original entry is popped.
pub async fn commands_processing_task(
    mut get_command: GetCommandFn,
    mut pop_command: PopCommandFn,
    mut report_result: ReportResultFn,
    mut dispatch: DispatchFn,
    keep_running: Arc<AtomicBool>,
) {
    while keep_running.load(Ordering::SeqCst) {
        let Some(entry) = get_command().await else {
            tokio::time::sleep(EMPTY_QUEUE_TICK).await;
            continue;
        };

        debug!(id = %entry.id, module = %entry.module, command = %entry.command, "dispatching command");
        let terminal = dispatch(entry).await;
        report_result(terminal).await;
        pop_command().await;
    }
}

/// Awaits a target's execution under the per-command deadline.
///
/// Deadline expiry yields `Timeout`, an error yields `Failure` with the
/// error text, and a normal return carries the target's own result.
pub async fn execute_with_deadline<F>(
    entry: CommandEntry,
    execution: F,
    deadline: Duration,
) -> CommandEntry
where
    F: Future<Output = ModuleResult<CommandResult>>,
{
    match tokio::time::timeout(deadline, execution).await {
        Err(_elapsed) => entry.with_result(CommandResult::new(
            CommandStatus::Timeout,
            "command execution timed out",
        )),
        Ok(Err(err)) => entry.with_result(CommandResult::failure(err.to_string())),
        Ok(Ok(result)) => entry.with_result(result),
    }
}

/// Terminal entry for a command whose routing key matched no module.
#[must_use]
pub fn unknown_module_result(entry: CommandEntry) -> CommandEntry {
    let module = entry.module.clone();
    entry.with_result(CommandResult::failure(format!("unknown module `{module}`")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleError;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn entry(id: &str, module: &str) -> CommandEntry {
        CommandEntry::from_queue_payload(&json!({
            "id": id,
            "module": module,
            "command": "scan",
            "parameters": {}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn unknown_module_fails_without_touching_targets() {
        let terminal = unknown_module_result(entry("x", "ghost"));
        assert_eq!(terminal.execution_result.status, CommandStatus::Failure);
        assert!(terminal.execution_result.message.contains("ghost"));
    }

    #[tokio::test]
    async fn deadline_expiry_yields_timeout() {
        let terminal = execute_with_deadline(
            entry("x", "inventory"),
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(CommandResult::success("late"))
            },
            Duration::from_millis(20),
        )
        .await;

        assert_eq!(terminal.execution_result.status, CommandStatus::Timeout);
    }

    #[tokio::test]
    async fn module_errors_yield_failure() {
        let terminal = execute_with_deadline(
            entry("x", "inventory"),
            async { Err(ModuleError::failed("disk on fire")) },
            DEFAULT_COMMAND_TIMEOUT,
        )
        .await;

        assert_eq!(terminal.execution_result.status, CommandStatus::Failure);
        assert!(terminal.execution_result.message.contains("disk on fire"));
    }

    #[tokio::test]
    async fn normal_returns_carry_the_module_result() {
        let terminal = execute_with_deadline(
            entry("x", "inventory"),
            async { Ok(CommandResult::success("scanned 42 packages")) },
            DEFAULT_COMMAND_TIMEOUT,
        )
        .await;

        assert_eq!(terminal.execution_result.status, CommandStatus::Success);
        assert_eq!(terminal.execution_result.message, "scanned 42 packages");
    }

    #[tokio::test]
    async fn loop_reports_then_pops_each_command() {
        let keep_running = Arc::new(AtomicBool::new(true));
        let queue = Arc::new(Mutex::new(VecDeque::from([entry("1", "inventory")])));
        let reported = Arc::new(Mutex::new(Vec::new()));
        let pops = Arc::new(AtomicUsize::new(0));

        let get_command: GetCommandFn = {
            let queue = Arc::clone(&queue);
            let keep_running = Arc::clone(&keep_running);
            Box::new(move || {
                let queue = Arc::clone(&queue);
                let keep_running = Arc::clone(&keep_running);
                Box::pin(async move {
                    let next = queue.lock().unwrap().pop_front();
                    if next.is_none() {
                        // Nothing left for this test; stop instead of
                        // sleeping out the empty-queue tick.
                        keep_running.store(false, Ordering::SeqCst);
                    }
                    next
                })
            })
        };
        let pop_command: PopCommandFn = {
            let pops = Arc::clone(&pops);
            Box::new(move || {
                let pops = Arc::clone(&pops);
                Box::pin(async move {
                    pops.fetch_add(1, Ordering::SeqCst);
                })
            })
        };
        let report_result: ReportResultFn = {
            let reported = Arc::clone(&reported);
            Box::new(move |terminal| {
                let reported = Arc::clone(&reported);
                Box::pin(async move {
                    reported.lock().unwrap().push(terminal);
                })
            })
        };
        let dispatch: DispatchFn = Box::new(|entry| {
            Box::pin(async move {
                execute_with_deadline(
                    entry,
                    async { Ok(CommandResult::success("ok")) },
                    DEFAULT_COMMAND_TIMEOUT,
                )
                .await
            })
        });

        commands_processing_task(
            get_command,
            pop_command,
            report_result,
            dispatch,
            keep_running,
        )
        .await;

        assert_eq!(pops.load(Ordering::SeqCst), 1);
        let reported = reported.lock().unwrap();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].id, "1");
        assert_eq!(reported[0].execution_result.status, CommandStatus::Success);
    }
}
