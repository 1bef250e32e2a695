//! Module capability surface and the module manager.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info};

use warden_config::ConfigStore;
use warden_primitives::{CommandResult, Message};

use crate::tasks::TaskManager;
use crate::{KernelError, KernelResult};

/// Return value modules receive when their message was enqueued.
pub const PUSH_MESSAGE_OK: i32 = 0;

/// Enqueues a telemetry message, resolving to [`PUSH_MESSAGE_OK`] on
/// success. Injected into every module before `setup`; modules must not
/// retain it across their own `stop`.
pub type PushMessageFn = Arc<dyn Fn(Message) -> BoxFuture<'static, i32> + Send + Sync>;

/// Errors raised from module entry points.
#[derive(Debug, Error)]
pub enum ModuleError {
    /// The module reported a failure; never allowed to kill the process.
    #[error("module failure: {reason}")]
    Failed {
        /// Human-readable context from the module.
        reason: String,
    },
}

impl ModuleError {
    /// Convenience constructor.
    #[must_use]
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

/// Result alias for module entry points.
pub type ModuleResult<T> = Result<T, ModuleError>;

/// Capability set every collection/response module implements.
///
/// `start` must not block: modules schedule their own long-lived work onto
/// the task manager. Errors thrown from any entry point are logged and
/// isolated by the manager.
#[async_trait]
pub trait Module: Send + Sync {
    /// Stable unique module name used as the command routing key.
    fn name(&self) -> &str;

    /// Reads configuration; called once before `start` and again on
    /// configuration reloads.
    async fn setup(&self, config: &ConfigStore) -> ModuleResult<()>;

    /// Begins producing telemetry. Expected to return promptly.
    async fn start(&self) -> ModuleResult<()>;

    /// Stops producing telemetry and releases resources.
    async fn stop(&self) -> ModuleResult<()>;

    /// Executes a directed command, resolving to its terminal result.
    async fn execute_command(&self, command: &str, parameters: Value)
        -> ModuleResult<CommandResult>;

    /// Receives the enqueue function before `setup` runs.
    fn set_push_message_fn(&self, push: PushMessageFn);
}

#[derive(Default)]
struct ModuleSet {
    order: Vec<Arc<dyn Module>>,
    by_name: HashMap<String, usize>,
}

/// Insertion-ordered registry of modules.
///
/// Not reentrant: manager methods must not be invoked from inside a module
/// callback.
pub struct ModuleManager {
    modules: Mutex<ModuleSet>,
    push: PushMessageFn,
    config: Arc<ConfigStore>,
    tasks: Arc<TaskManager>,
    running: AtomicBool,
}

impl ModuleManager {
    /// Creates a manager that injects `push` into every module and hands
    /// `config` to their `setup`.
    #[must_use]
    pub fn new(push: PushMessageFn, config: Arc<ConfigStore>, tasks: Arc<TaskManager>) -> Self {
        Self {
            modules: Mutex::new(ModuleSet::default()),
            push,
            config,
            tasks,
            running: AtomicBool::new(false),
        }
    }

    /// Registers a module under the name it reports.
    ///
    /// The name is captured exactly once at registration time.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::DuplicateModule`] when the name is taken; the
    /// original module stays registered.
    pub fn add_module(&self, module: Arc<dyn Module>) -> KernelResult<()> {
        let name = module.name().to_owned();
        let mut modules = lock(&self.modules);

        if modules.by_name.contains_key(&name) {
            return Err(KernelError::DuplicateModule(name));
        }

        debug!(module = %name, "module registered");
        let index = modules.order.len();
        modules.by_name.insert(name, index);
        modules.order.push(module);
        Ok(())
    }

    /// Looks up a module by name.
    #[must_use]
    pub fn get_module(&self, name: &str) -> Option<Arc<dyn Module>> {
        let modules = lock(&self.modules);
        let index = *modules.by_name.get(name)?;
        Some(Arc::clone(&modules.order[index]))
    }

    fn snapshot(&self) -> Vec<Arc<dyn Module>> {
        lock(&self.modules).order.clone()
    }

    /// Injects the push function and runs `setup` on every module in
    /// insertion order. A failing module is logged and skipped; the rest
    /// still run.
    pub async fn setup(&self) {
        for module in self.snapshot() {
            module.set_push_message_fn(Arc::clone(&self.push));
            if let Err(err) = module.setup(&self.config).await {
                error!(module = module.name(), %err, "module setup failed");
            }
        }
    }

    /// Starts every module in insertion order.
    ///
    /// Each `start` runs as its own task so one slow module cannot delay
    /// the others; failures are logged and isolated.
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        for module in self.snapshot() {
            let name = module.name().to_owned();
            let result = self.tasks.enqueue_task(async move {
                if let Err(err) = module.start().await {
                    error!(module = %name, %err, "module start failed");
                }
            });
            if let Err(err) = result {
                error!(%err, "could not schedule module start");
            }
        }
    }

    /// Stops every module in insertion order. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        for module in self.snapshot() {
            if let Err(err) = module.stop().await {
                error!(module = module.name(), %err, "module stop failed");
            }
        }
        info!("modules stopped");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
