//! Contract with the container runtime that provides isolated environments.
//!
//! The orchestrator only ever talks to a [`ContainerRuntime`]: create an
//! environment, run a bounded shell invocation in it, spawn a streaming
//! process in it, destroy it. Backends live in the submodules.

use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;

pub mod docker;
pub mod host;
mod process;

#[cfg(test)]
pub mod fake;

pub use docker::DockerRuntime;
pub use host::HostRuntime;

/// Image and resource limits for a new environment.
#[derive(Debug, Clone)]
pub struct EnvironmentSpec {
    pub image: String,
    pub memory: String,
    pub cpus: String,
    pub network: String,
}

impl EnvironmentSpec {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            image: config.image.clone(),
            memory: config.memory.clone(),
            cpus: config.cpus.clone(),
            network: config.network.clone(),
        }
    }
}

/// Reference to a live environment, as returned by [`ContainerRuntime::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentHandle {
    pub id: String,
    /// Absolute directory new sessions start in.
    pub home: String,
}

/// A user command together with the directory it must run in.
///
/// Every invocation is a fresh process, so the directory is re-applied as a
/// `cd` prefix each time.
#[derive(Debug, Clone)]
pub struct ShellInvocation {
    pub working_directory: String,
    pub command: String,
}

impl ShellInvocation {
    pub fn new(working_directory: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            working_directory: working_directory.into(),
            command: command.into(),
        }
    }

    /// The single shell script handed to `sh -c`.
    pub fn script(&self) -> String {
        format!("cd {} && {}", shell_quote(&self.working_directory), self.command)
    }
}

/// Captured output of a finished (or killed) invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(CommandOutput),
    /// Killed after exceeding its deadline; carries what was produced before the cutoff.
    TimedOut(CommandOutput),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output { stream: OutputStream, data: Vec<u8> },
    /// Always the last event of a process.
    Exited { code: Option<i32> },
}

/// A spawned process delivering its output as it is produced.
///
/// Dropping the handle kills the process, so a consumer that goes away can
/// never leave an orphan behind.
#[derive(Debug)]
pub struct ProcessHandle {
    events: mpsc::Receiver<ProcessEvent>,
    kill: Option<oneshot::Sender<()>>,
}

impl ProcessHandle {
    pub fn new(events: mpsc::Receiver<ProcessEvent>, kill: oneshot::Sender<()>) -> Self {
        Self {
            events,
            kill: Some(kill),
        }
    }

    pub async fn next_event(&mut self) -> Option<ProcessEvent> {
        self.events.recv().await
    }

    pub fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<ProcessEvent>> {
        self.events.poll_recv(cx)
    }

    /// Request termination. Events already produced may still be delivered.
    pub fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create(&self, spec: &EnvironmentSpec) -> Result<EnvironmentHandle, RuntimeError>;

    /// Run to completion, killing the invocation once `timeout` elapses.
    async fn run(
        &self,
        env: &EnvironmentHandle,
        invocation: &ShellInvocation,
        timeout: Duration,
    ) -> Result<RunOutcome, RuntimeError>;

    async fn spawn(
        &self,
        env: &EnvironmentHandle,
        invocation: &ShellInvocation,
    ) -> Result<ProcessHandle, RuntimeError>;

    /// Idempotent: destroying an environment that is already gone succeeds.
    async fn destroy(&self, env: &EnvironmentHandle) -> Result<(), RuntimeError>;
}

/// Quote `value` as a single POSIX shell word.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
