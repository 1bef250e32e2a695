//! The agent orchestrator.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, info, warn};

use warden_comms::{
    Communicator, CommsConfig, HttpClient, HttpTransport, HyperTransport, MessageGetter,
    SuccessHandler,
};
use warden_config::{ConfigStore, GroupProvider};
use warden_kernel::{
    commands_processing_task, execute_with_deadline, unknown_module_result, DispatchFn,
    GetCommandFn, KernelResult, Module, ModuleManager, PopCommandFn, PushMessageFn,
    ReportResultFn, SignalDispatcher, SignalHandle, TaskManager, DEFAULT_COMMAND_TIMEOUT,
    PUSH_MESSAGE_OK,
};
use warden_primitives::{CommandEntry, MessageType};
use warden_queue::MultiTypeQueue;

use crate::agent_info::{default_state_dir, AgentInfo};
use crate::centralized::{
    CentralizedConfiguration, DownloadGroupFileFn, GetGroupsFn, ReloadFn, SetGroupsFn,
};
use crate::{queue_utils, AgentResult};

/// Signal that re-runs the configuration pipeline.
pub const RELOAD_SIGNAL: &str = "reload";
/// Signal that begins orderly shutdown.
pub const SHUTDOWN_SIGNAL: &str = "shutdown";

/// Byte budget for one upload batch when the configuration is silent.
const DEFAULT_MAX_BATCHING_SIZE: usize = 1_000_000;
/// Smallest accepted batching budget.
const MIN_BATCHING_SIZE: usize = 1000;

/// Live health summary reported by the `status` command.
#[derive(Debug, Clone, Copy)]
pub struct AgentStatus {
    /// Whether the communicator loops are still running.
    pub comms_running: bool,
    /// Whether a non-empty, unexpired token is installed.
    pub token_valid: bool,
}

/// Assembles an [`Agent`] from configuration, state directory and
/// transport overrides.
#[derive(Default)]
pub struct AgentBuilder {
    config_path: Option<PathBuf>,
    config_literal: Option<String>,
    state_dir: Option<PathBuf>,
    transport: Option<Arc<dyn HttpTransport>>,
}

impl AgentBuilder {
    /// Starts an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the base configuration from an explicit file.
    #[must_use]
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Reads the base configuration from an in-memory document.
    #[must_use]
    pub fn with_config_literal(mut self, document: impl Into<String>) -> Self {
        self.config_literal = Some(document.into());
        self
    }

    /// Overrides the state directory (identity, queue and shared files).
    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Overrides the HTTP transport (tests inject fakes here).
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Builds the agent.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError`](crate::AgentError) when the configuration
    /// literal is malformed, the identity store is unusable, or the queue
    /// directory cannot be opened.
    pub async fn build(self) -> AgentResult<Agent> {
        let state_dir_overridden = self.state_dir.is_some();
        let state_dir = self.state_dir.unwrap_or_else(default_state_dir);

        let mut config = match (self.config_literal, self.config_path) {
            (Some(document), _) => ConfigStore::from_literal(document)?,
            (None, Some(path)) => ConfigStore::from_file(path),
            (None, None) => ConfigStore::from_default_path(),
        };
        if state_dir_overridden {
            config.set_shared_dir(state_dir.join("shared"));
        }
        std::fs::create_dir_all(config.shared_dir()).ok();

        let info = Arc::new(AgentInfo::load(&state_dir)?);

        let provider: GroupProvider = {
            let info = Arc::clone(&info);
            Arc::new(move || info.groups())
        };
        config.set_group_provider(provider);
        if let Err(err) = config.reload() {
            warn!(%err, "shared configuration could not be applied at startup");
        }
        let config = Arc::new(config);

        let queue = Arc::new(MultiTypeQueue::open(state_dir.join("queue")).await?);
        let tasks = Arc::new(TaskManager::default());

        let comms_config = CommsConfig {
            host: config
                .get::<String>("agent", "manager_ip")
                .unwrap_or_else(|| "localhost".to_owned()),
            port: config
                .get::<i64>("agent", "agent_comms_api_port")
                .and_then(|port| u16::try_from(port).ok())
                .unwrap_or(27000),
            use_https: config.get::<bool>("agent", "use_https").unwrap_or(true),
            user_agent: info.header_info(),
            retry_interval: config
                .get_time_millis("agent", "retry_interval")
                .map_or(Duration::from_secs(5), Duration::from_millis),
            batching_interval: config
                .get_time_millis("agent", "batch_interval")
                .map_or(Duration::from_secs(10), Duration::from_millis),
        };

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HyperTransport::new()));
        let http = Arc::new(HttpClient::new(transport));
        let comms = Arc::new(Communicator::new(
            http,
            comms_config,
            info.uuid(),
            info.key(),
        ));

        let mut max_batching_size = config
            .get::<i64>("agent", "max_batching_size")
            .and_then(|value| usize::try_from(value).ok())
            .unwrap_or(DEFAULT_MAX_BATCHING_SIZE);
        if max_batching_size < MIN_BATCHING_SIZE {
            warn!(
                max_batching_size,
                "max_batching_size is below the floor, using the default"
            );
            max_batching_size = DEFAULT_MAX_BATCHING_SIZE;
        }

        let command_timeout = config
            .get_time_millis("agent", "command_timeout")
            .map_or(DEFAULT_COMMAND_TIMEOUT, Duration::from_millis);

        let push: PushMessageFn = {
            let queue = Arc::clone(&queue);
            Arc::new(move |message| {
                let queue = Arc::clone(&queue);
                Box::pin(async move {
                    match queue.push(message).await {
                        Ok(_) => PUSH_MESSAGE_OK,
                        Err(err) => {
                            error!(%err, "module message could not be enqueued");
                            -1
                        }
                    }
                })
            })
        };
        let modules = Arc::new(ModuleManager::new(
            push,
            Arc::clone(&config),
            Arc::clone(&tasks),
        ));

        let set_groups: SetGroupsFn = {
            let info = Arc::clone(&info);
            Arc::new(move |groups| match info.set_groups(groups) {
                Ok(()) => true,
                Err(err) => {
                    error!(%err, "group assignment could not be persisted");
                    false
                }
            })
        };
        let get_groups: GetGroupsFn = {
            let info = Arc::clone(&info);
            Arc::new(move || info.groups())
        };
        let download: DownloadGroupFileFn = {
            let comms = Arc::clone(&comms);
            Arc::new(move |group, destination| {
                let comms = Arc::clone(&comms);
                Box::pin(async move {
                    comms
                        .get_group_configuration_from_manager(&group, &destination)
                        .await
                })
            })
        };
        let reload: ReloadFn = {
            let config = Arc::clone(&config);
            Arc::new(move || match config.reload() {
                Ok(()) => true,
                Err(err) => {
                    warn!(%err, "configuration reload failed");
                    false
                }
            })
        };
        let centralized = Arc::new(CentralizedConfiguration::new(
            set_groups,
            get_groups,
            download,
            reload,
            config.shared_dir().to_path_buf(),
        ));

        let signals = SignalDispatcher::new();
        let shutdown = Arc::new(Notify::new());

        let reload_handle = signals.register(RELOAD_SIGNAL, {
            let config = Arc::clone(&config);
            move || match config.reload() {
                Ok(()) => info!("configuration reloaded"),
                Err(err) => warn!(%err, "configuration reload failed"),
            }
        });
        let shutdown_handle = signals.register(SHUTDOWN_SIGNAL, {
            let shutdown = Arc::clone(&shutdown);
            move || shutdown.notify_one()
        });

        Ok(Agent {
            config,
            info,
            queue,
            tasks,
            comms,
            modules,
            centralized,
            signals,
            shutdown,
            commands_running: Arc::new(AtomicBool::new(false)),
            max_batching_size,
            command_timeout,
            _signal_handles: vec![reload_handle, shutdown_handle],
        })
    }
}

/// Long-running endpoint agent.
///
/// Owns the task manager, the durable queue, the communicator, the module
/// manager and the configuration store, and drives their startup and
/// shutdown order.
pub struct Agent {
    config: Arc<ConfigStore>,
    info: Arc<AgentInfo>,
    queue: Arc<MultiTypeQueue>,
    tasks: Arc<TaskManager>,
    comms: Arc<Communicator>,
    modules: Arc<ModuleManager>,
    centralized: Arc<CentralizedConfiguration>,
    signals: SignalDispatcher,
    shutdown: Arc<Notify>,
    commands_running: Arc<AtomicBool>,
    max_batching_size: usize,
    command_timeout: Duration,
    _signal_handles: Vec<SignalHandle>,
}

impl Agent {
    /// Starts a builder.
    #[must_use]
    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    /// Registers a collection/response module.
    ///
    /// # Errors
    ///
    /// Returns an error when another module already claimed the name.
    pub fn add_module(&self, module: Arc<dyn Module>) -> KernelResult<()> {
        self.modules.add_module(module)
    }

    /// Returns the configuration store.
    #[must_use]
    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    /// Returns the persistent identity.
    #[must_use]
    pub fn agent_info(&self) -> &Arc<AgentInfo> {
        &self.info
    }

    /// Returns the durable queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<MultiTypeQueue> {
        &self.queue
    }

    /// Returns the signal dispatcher for embedders to wire into.
    #[must_use]
    pub fn signals(&self) -> &SignalDispatcher {
        &self.signals
    }

    /// Live health summary.
    #[must_use]
    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            comms_running: self.comms.is_running(),
            token_valid: self.comms.token().is_valid(),
        }
    }

    /// Raises the shutdown signal; [`run`](Self::run) then stops the
    /// subsystems in order.
    pub fn request_shutdown(&self) {
        self.signals.notify(SHUTDOWN_SIGNAL);
    }

    /// Runs the agent until shutdown is requested.
    pub async fn run(&self) {
        info!(uuid = %self.info.uuid(), "agent starting");

        self.spawn_auth_task();
        self.spawn_commands_poll();
        self.spawn_upload_loop(MessageType::Stateful);
        self.spawn_upload_loop(MessageType::Stateless);

        self.modules.setup().await;
        self.modules.start();

        self.spawn_command_processing();

        self.shutdown.notified().await;
        info!("shutdown requested");
        self.stop().await;
    }

    fn spawn_auth_task(&self) {
        let comms = Arc::clone(&self.comms);
        let result = self.tasks.enqueue_task(async move {
            comms.wait_for_token_expiration_and_authenticate().await;
        });
        if let Err(err) = result {
            error!(%err, "could not schedule the authentication task");
        }
    }

    fn spawn_commands_poll(&self) {
        let on_success: SuccessHandler = {
            let queue = Arc::clone(&self.queue);
            Box::new(move |body: String| {
                let queue = Arc::clone(&queue);
                Box::pin(async move {
                    if let Err(err) = queue_utils::push_commands_to_queue(&queue, &body).await {
                        error!(%err, "manager commands could not be enqueued");
                    }
                })
            })
        };

        let comms = Arc::clone(&self.comms);
        let result = self.tasks.enqueue_task(async move {
            comms.get_commands_from_manager(on_success).await;
        });
        if let Err(err) = result {
            error!(%err, "could not schedule the command poll loop");
        }
    }

    /// Spawns one upload loop. The stateful loop also drains command
    /// results, which are snapshot-class records the server deduplicates
    /// by command id.
    fn spawn_upload_loop(&self, primary: MessageType) {
        let drained = Arc::new(Mutex::new((primary, 0_usize)));

        let getter: MessageGetter = {
            let queue = Arc::clone(&self.queue);
            let info = Arc::clone(&self.info);
            let drained = Arc::clone(&drained);
            let max_bytes = self.max_batching_size;
            Box::new(move || {
                let queue = Arc::clone(&queue);
                let info = Arc::clone(&info);
                let drained = Arc::clone(&drained);
                Box::pin(async move {
                    let lane = if primary == MessageType::Stateful {
                        tokio::select! {
                            biased;
                            _ = queue.get_next(MessageType::CommandResult, "") => {
                                MessageType::CommandResult
                            }
                            _ = queue.get_next(MessageType::Stateful, "") => MessageType::Stateful,
                        }
                    } else {
                        primary
                    };

                    let (body, count) = queue_utils::get_messages_from_queue(
                        &queue,
                        lane,
                        max_bytes,
                        Some(info.metadata_info()),
                    )
                    .await;
                    *lock(&drained) = (lane, count);
                    body
                })
            })
        };

        let on_success: SuccessHandler = {
            let queue = Arc::clone(&self.queue);
            let drained = Arc::clone(&drained);
            Box::new(move |_body: String| {
                let queue = Arc::clone(&queue);
                let drained = Arc::clone(&drained);
                Box::pin(async move {
                    let (lane, count) = *lock(&drained);
                    if count > 0 {
                        if let Err(err) = queue.pop_n(lane, count, "").await {
                            error!(%err, "acknowledged batch could not be popped");
                        }
                    }
                })
            })
        };

        let comms = Arc::clone(&self.comms);
        let result = self.tasks.enqueue_task(async move {
            match primary {
                MessageType::Stateful => {
                    comms
                        .stateful_message_processing_task(getter, on_success)
                        .await;
                }
                _ => {
                    comms
                        .stateless_message_processing_task(getter, on_success)
                        .await;
                }
            }
        });
        if let Err(err) = result {
            error!(%err, "could not schedule an upload loop");
        }
    }

    fn spawn_command_processing(&self) {
        self.commands_running.store(true, Ordering::SeqCst);

        let get_command: GetCommandFn = {
            let queue = Arc::clone(&self.queue);
            Box::new(move || {
                let queue = Arc::clone(&queue);
                Box::pin(async move { queue_utils::get_command_from_queue(&queue).await })
            })
        };
        let pop_command: PopCommandFn = {
            let queue = Arc::clone(&self.queue);
            Box::new(move || {
                let queue = Arc::clone(&queue);
                Box::pin(async move {
                    if let Err(err) = queue.pop_n(MessageType::Command, 1, "").await {
                        error!(%err, "dispatched command could not be popped");
                    }
                })
            })
        };
        let report_result: ReportResultFn = {
            let queue = Arc::clone(&self.queue);
            Box::new(move |entry: CommandEntry| {
                let queue = Arc::clone(&queue);
                Box::pin(async move { queue_utils::report_command_result(&queue, &entry).await })
            })
        };
        let dispatch: DispatchFn = {
            let modules = Arc::clone(&self.modules);
            let centralized = Arc::clone(&self.centralized);
            let timeout = self.command_timeout;
            Box::new(move |entry: CommandEntry| {
                let modules = Arc::clone(&modules);
                let centralized = Arc::clone(&centralized);
                Box::pin(async move { dispatch_entry(entry, &modules, &centralized, timeout).await })
            })
        };

        let keep_running = Arc::clone(&self.commands_running);
        let result = self.tasks.enqueue_task(commands_processing_task(
            get_command,
            pop_command,
            report_result,
            dispatch,
            keep_running,
        ));
        if let Err(err) = result {
            error!(%err, "could not schedule the command processing loop");
        }
    }

    async fn stop(&self) {
        self.comms.stop();
        self.commands_running.store(false, Ordering::SeqCst);
        self.modules.stop().await;
        self.tasks.shutdown().await;
        info!("agent stopped");
    }
}

async fn dispatch_entry(
    entry: CommandEntry,
    modules: &ModuleManager,
    centralized: &CentralizedConfiguration,
    timeout: Duration,
) -> CommandEntry {
    if entry.targets_centralized_configuration() {
        let command = entry.command.clone();
        let parameters = entry.parameters.clone();
        return execute_with_deadline(
            entry,
            centralized.execute_command(&command, parameters),
            timeout,
        )
        .await;
    }

    match modules.get_module(&entry.module) {
        None => unknown_module_result(entry),
        Some(module) => {
            let command = entry.command.clone();
            let parameters = entry.parameters.clone();
            execute_with_deadline(
                entry,
                async move { module.execute_command(&command, parameters).await },
                timeout,
            )
            .await
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
