//! Command line entry point for the warden agent.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use warden_agent::{Agent, AgentError, AgentInfo};
use warden_comms::{HttpClient, DEFAULT_USER_AGENT};

/// Exit code for configuration or argument problems.
const EXIT_CONFIG: u8 = 1;
/// Exit code for I/O problems.
const EXIT_IO: u8 = 2;
/// Exit code for authentication problems.
const EXIT_AUTH: u8 = 3;

#[derive(Parser)]
#[command(name = "warden-agent", about = "Warden endpoint agent", version)]
struct Cli {
    /// Overrides the state directory.
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs the agent in the foreground until interrupted.
    Run {
        /// Overrides the configuration file path.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Reports whether an agent process is running here.
    Status,
    /// Stores enrolment credentials, optionally validating them against
    /// the manager with a management user.
    Register {
        /// Enrolment uuid issued by the manager.
        #[arg(long)]
        uuid: String,
        /// Enrolment key issued by the manager.
        #[arg(long)]
        key: String,
        /// Management user for credential validation.
        #[arg(long, requires = "password")]
        user: Option<String>,
        /// Management password for credential validation.
        #[arg(long, requires = "user")]
        password: Option<String>,
        /// Manager host, used only with --user/--password.
        #[arg(long, default_value = "localhost")]
        host: String,
        /// Management API port, used only with --user/--password.
        #[arg(long, default_value_t = 55000)]
        port: u16,
    },
}

fn state_dir(cli_override: Option<PathBuf>) -> PathBuf {
    cli_override.unwrap_or_else(warden_agent::default_state_dir)
}

fn pid_file(state_dir: &std::path::Path) -> PathBuf {
    state_dir.join("warden-agent.pid")
}

async fn run(config: Option<PathBuf>, state_dir: PathBuf) -> ExitCode {
    let mut builder = Agent::builder().with_state_dir(state_dir.clone());
    if let Some(config) = config {
        builder = builder.with_config_path(config);
    }

    let agent = match builder.build().await {
        Ok(agent) => Arc::new(agent),
        Err(err) => {
            error!(%err, "agent could not be assembled");
            let code = match err {
                AgentError::Config(_) => EXIT_CONFIG,
                _ => EXIT_IO,
            };
            return ExitCode::from(code);
        }
    };

    let pid_path = pid_file(&state_dir);
    if let Err(err) = std::fs::write(&pid_path, std::process::id().to_string()) {
        error!(%err, "could not write the pid file");
        return ExitCode::from(EXIT_IO);
    }

    let runner = {
        let agent = Arc::clone(&agent);
        tokio::spawn(async move { agent.run().await })
    };

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("interrupt received"),
        Err(err) => error!(%err, "could not listen for interrupts"),
    }
    agent.request_shutdown();
    let _ = runner.await;

    let _ = std::fs::remove_file(&pid_path);
    ExitCode::SUCCESS
}

fn status(state_dir: &std::path::Path) -> ExitCode {
    match std::fs::read_to_string(pid_file(state_dir)) {
        Ok(pid) => {
            println!("warden-agent is running (pid {})", pid.trim());
            ExitCode::SUCCESS
        }
        Err(_) => {
            println!("warden-agent is not running");
            ExitCode::SUCCESS
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn register(
    state_dir: PathBuf,
    uuid: String,
    key: String,
    user: Option<String>,
    password: Option<String>,
    host: String,
    port: u16,
) -> ExitCode {
    if let (Some(user), Some(password)) = (user, password) {
        let client = HttpClient::with_default_transport();
        let token = client
            .authenticate_with_user_password(&host, port, true, DEFAULT_USER_AGENT, &user, &password)
            .await;
        if token.is_none() {
            error!("management credentials were rejected");
            return ExitCode::from(EXIT_AUTH);
        }
    }

    let info = match AgentInfo::load(&state_dir) {
        Ok(info) => info,
        Err(err) => {
            error!(%err, "identity store could not be opened");
            return ExitCode::from(EXIT_IO);
        }
    };

    match info.set_credentials(&uuid, &key) {
        Ok(()) => {
            info!(uuid, "enrolment credentials stored");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(%err, "enrolment credentials could not be stored");
            ExitCode::from(EXIT_IO)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let dir = state_dir(cli.state_dir);

    match cli.command {
        Command::Run { config } => run(config, dir).await,
        Command::Status => status(&dir),
        Command::Register {
            uuid,
            key,
            user,
            password,
            host,
            port,
        } => register(dir, uuid, key, user, password, host, port).await,
    }
}
