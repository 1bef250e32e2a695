//! Executor for commands targeting the configuration subsystem.

use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{info, warn};

use warden_kernel::{ModuleError, ModuleResult};
use warden_primitives::CommandResult;

/// Persists the new group list; `false` aborts the command.
pub type SetGroupsFn = Arc<dyn Fn(Vec<String>) -> bool + Send + Sync>;
/// Returns the currently persisted group list.
pub type GetGroupsFn = Arc<dyn Fn() -> Vec<String> + Send + Sync>;
/// Fetches one group overlay file into the given destination.
pub type DownloadGroupFileFn =
    Arc<dyn Fn(String, PathBuf) -> BoxFuture<'static, bool> + Send + Sync>;
/// Reloads the configuration store; `false` marks the command failed.
pub type ReloadFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// Handles the `CentralizedConfiguration` pseudo-module commands.
///
/// Wired with closures so it never holds references back into the
/// orchestrator.
pub struct CentralizedConfiguration {
    set_groups: SetGroupsFn,
    get_groups: GetGroupsFn,
    download: DownloadGroupFileFn,
    reload: ReloadFn,
    shared_dir: PathBuf,
}

impl CentralizedConfiguration {
    /// Creates the executor.
    #[must_use]
    pub fn new(
        set_groups: SetGroupsFn,
        get_groups: GetGroupsFn,
        download: DownloadGroupFileFn,
        reload: ReloadFn,
        shared_dir: PathBuf,
    ) -> Self {
        Self {
            set_groups,
            get_groups,
            download,
            reload,
            shared_dir,
        }
    }

    /// Executes a configuration command.
    ///
    /// `set-group` persists the groups named in `parameters.groups`,
    /// fetches their overlay files and reloads; `update-group` re-fetches
    /// the current groups and reloads without changing the list.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError`] for unrecognized commands or malformed
    /// parameters; operational failures resolve to a failure result
    /// instead.
    pub async fn execute_command(
        &self,
        command: &str,
        parameters: Value,
    ) -> ModuleResult<CommandResult> {
        match command {
            "set-group" => {
                let groups = parse_groups(&parameters)?;
                info!(?groups, "applying group assignment");

                if !(self.set_groups)(groups.clone()) {
                    return Ok(CommandResult::failure("could not persist group assignment"));
                }
                self.fetch_and_reload(groups).await
            }
            "update-group" => {
                let groups = (self.get_groups)();
                info!(?groups, "refreshing group configuration");
                self.fetch_and_reload(groups).await
            }
            other => Err(ModuleError::failed(format!(
                "unrecognized configuration command `{other}`"
            ))),
        }
    }

    async fn fetch_and_reload(&self, groups: Vec<String>) -> ModuleResult<CommandResult> {
        for group in &groups {
            let destination = self.shared_dir.join(format!("{group}.conf"));
            if !(self.download)(group.clone(), destination).await {
                warn!(group, "group file fetch failed");
                return Ok(CommandResult::failure(format!(
                    "could not fetch configuration for group `{group}`"
                )));
            }
        }

        if (self.reload)() {
            Ok(CommandResult::success("group configuration applied"))
        } else {
            Ok(CommandResult::failure(
                "group configuration fetched but reload failed",
            ))
        }
    }
}

fn parse_groups(parameters: &Value) -> ModuleResult<Vec<String>> {
    let groups: Option<Vec<String>> = parameters.get("groups").and_then(Value::as_array).map(
        |items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        },
    );

    match groups {
        Some(groups) if !groups.is_empty() => Ok(groups),
        _ => Err(ModuleError::failed(
            "set-group requires a non-empty `groups` array",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use warden_primitives::CommandStatus;

    struct Harness {
        executor: CentralizedConfiguration,
        persisted: Arc<Mutex<Vec<String>>>,
        downloads: Arc<Mutex<Vec<String>>>,
        reloaded: Arc<AtomicBool>,
    }

    fn harness(download_succeeds: bool) -> Harness {
        let persisted = Arc::new(Mutex::new(vec!["default".to_owned()]));
        let downloads = Arc::new(Mutex::new(Vec::new()));
        let reloaded = Arc::new(AtomicBool::new(false));

        let set_groups: SetGroupsFn = {
            let persisted = Arc::clone(&persisted);
            Arc::new(move |groups| {
                *persisted.lock().unwrap() = groups;
                true
            })
        };
        let get_groups: GetGroupsFn = {
            let persisted = Arc::clone(&persisted);
            Arc::new(move || persisted.lock().unwrap().clone())
        };
        let download: DownloadGroupFileFn = {
            let downloads = Arc::clone(&downloads);
            Arc::new(move |group, _dst| {
                let downloads = Arc::clone(&downloads);
                Box::pin(async move {
                    downloads.lock().unwrap().push(group);
                    download_succeeds
                })
            })
        };
        let reload: ReloadFn = {
            let reloaded = Arc::clone(&reloaded);
            Arc::new(move || {
                reloaded.store(true, Ordering::SeqCst);
                true
            })
        };

        Harness {
            executor: CentralizedConfiguration::new(
                set_groups,
                get_groups,
                download,
                reload,
                PathBuf::from("/tmp/shared"),
            ),
            persisted,
            downloads,
            reloaded,
        }
    }

    #[tokio::test]
    async fn set_group_persists_fetches_and_reloads() {
        let harness = harness(true);

        let result = harness
            .executor
            .execute_command("set-group", json!({"groups": ["default", "linux"]}))
            .await
            .unwrap();

        assert_eq!(result.status, CommandStatus::Success);
        assert_eq!(*harness.persisted.lock().unwrap(), ["default", "linux"]);
        assert_eq!(*harness.downloads.lock().unwrap(), ["default", "linux"]);
        assert!(harness.reloaded.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn update_group_refreshes_without_changing_the_list() {
        let harness = harness(true);

        let result = harness
            .executor
            .execute_command("update-group", Value::Null)
            .await
            .unwrap();

        assert_eq!(result.status, CommandStatus::Success);
        assert_eq!(*harness.persisted.lock().unwrap(), ["default"]);
        assert_eq!(*harness.downloads.lock().unwrap(), ["default"]);
    }

    #[tokio::test]
    async fn failed_fetch_marks_the_command_failed() {
        let harness = harness(false);

        let result = harness
            .executor
            .execute_command("set-group", json!({"groups": ["linux"]}))
            .await
            .unwrap();

        assert_eq!(result.status, CommandStatus::Failure);
        assert!(!harness.reloaded.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn malformed_parameters_are_rejected() {
        let harness = harness(true);

        let err = harness
            .executor
            .execute_command("set-group", json!({"groups": []}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("non-empty"));

        let err = harness
            .executor
            .execute_command("reset-everything", Value::Null)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unrecognized"));
    }
}
