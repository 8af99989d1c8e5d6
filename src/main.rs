//! Shellbox - sandbox session orchestrator with HTTP API and live output streaming.
//!
//! Usage:
//!   shellbox serve [--port 8080]          # Start HTTP server
//!   shellbox run -- <command>             # One-off command in a fresh session

mod config;
mod error;
mod gc;
mod http_server;
mod orchestrator;
mod registry;
mod relay;
mod runtime;
mod state;

use std::process::exit;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::{Backend, Config};
use error::OrchestratorError;
use orchestrator::{ExecutionResult, Orchestrator};
use runtime::{ContainerRuntime, DockerRuntime, EnvironmentSpec, HostRuntime};
use state::AppState;

const DEFAULT_LOG_FILTER: &str = "shellbox=info,tower_http=info";
/// Exit status of `run` when the command hits the timeout.
const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Parser, Debug)]
#[command(name = "shellbox")]
#[command(about = "Sandbox session orchestrator with HTTP API")]
struct Args {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<String>,

    /// Runtime backend, overriding the config file
    #[arg(long, global = true, value_enum)]
    runtime: Option<Backend>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on, overriding the config file
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run one command in a fresh session and print its output
    Run {
        /// Command to run
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(backend) = args.runtime {
        config.runtime.backend = backend;
    }

    let orchestrator = Arc::new(build_orchestrator(&config)?);

    match args.command {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            let sweeper = gc::spawn(orchestrator.clone(), gc::ExpiryPolicy::from_config(&config.sessions));
            let result = http_server::run_server(&config.server, AppState::new(orchestrator.clone())).await;
            sweeper.abort();
            shutdown(&orchestrator).await;
            result
        }
        Commands::Run { command } => {
            let code = run_once(&orchestrator, &command.join(" ")).await?;
            exit(code);
        }
    }
}

fn build_orchestrator(config: &Config) -> anyhow::Result<Orchestrator> {
    let max_output = config.sessions.max_output_bytes;
    let runtime: Arc<dyn ContainerRuntime> = match config.runtime.backend {
        Backend::Docker => Arc::new(DockerRuntime::new(
            config.runtime.docker_bin.clone(),
            config.runtime.home_dir.clone(),
            max_output,
        )),
        Backend::Host => {
            std::fs::create_dir_all(&config.runtime.host_root)
                .with_context(|| format!("creating {}", config.runtime.host_root.display()))?;
            Arc::new(HostRuntime::new(config.runtime.host_root.clone(), max_output))
        }
    };
    info!(runtime = runtime.name(), max_sessions = config.sessions.max_sessions, "Runtime ready");
    Ok(Orchestrator::new(
        runtime,
        EnvironmentSpec::from_config(&config.runtime),
        &config.sessions,
    ))
}

/// Create a session, run `command`, print its output and tear the session down.
async fn run_once(orchestrator: &Orchestrator, command: &str) -> anyhow::Result<i32> {
    let session = orchestrator.create_session().await?;
    let result = orchestrator.execute(&session.id, command).await;
    orchestrator.terminate(&session.id).await?;

    let code = match result {
        Ok(execution) => match execution.result {
            ExecutionResult::Output(output) => {
                print!("{}", output.stdout);
                eprint!("{}", output.stderr);
                output.exit_code.unwrap_or(1)
            }
            ExecutionResult::Navigated => 0,
            ExecutionResult::NavigationFailed { message } => {
                eprintln!("{message}");
                1
            }
        },
        Err(OrchestratorError::Timeout { limit, output }) => {
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            eprintln!("Error: command exceeded {} seconds", limit.as_secs());
            TIMEOUT_EXIT_CODE
        }
        Err(e) => return Err(e.into()),
    };
    Ok(code)
}

/// Destroy every remaining session before exiting.
async fn shutdown(orchestrator: &Orchestrator) {
    let sessions = orchestrator.sessions();
    info!(count = sessions.len(), "Destroying remaining sessions");
    for session in sessions {
        // Already gone means a sweep got there first.
        let _ = orchestrator.terminate(&session.id).await;
    }
}
