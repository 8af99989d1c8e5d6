//! Docker CLI backend.
//!
//! An environment is a long-lived `sleep infinity` container started with no
//! network and memory/CPU limits. Commands go through `docker exec`. Each
//! invocation records its in-container pid so timeouts and stream kills reach
//! the real process, not only the local `docker exec` client.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use super::process::{run_to_completion, spawn_streaming, KillTarget};
use super::{
    ContainerRuntime, EnvironmentHandle, EnvironmentSpec, ProcessHandle, RunOutcome,
    ShellInvocation,
};
use crate::error::RuntimeError;

const CONTAINER_PREFIX: &str = "shellbox_";
const DAEMON_ERROR_PREFIX: &str = "Error response from daemon";

pub struct DockerRuntime {
    docker_bin: String,
    home_dir: String,
    max_output: usize,
}

impl DockerRuntime {
    pub fn new(docker_bin: impl Into<String>, home_dir: impl Into<String>, max_output: usize) -> Self {
        Self {
            docker_bin: docker_bin.into(),
            home_dir: home_dir.into(),
            max_output,
        }
    }

    async fn docker(&self, args: &[String]) -> Result<std::process::Output, RuntimeError> {
        Command::new(&self.docker_bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| RuntimeError::Launch {
                program: self.docker_bin.clone(),
                source,
            })
    }

    /// `docker exec` of `invocation`, plus the matching kill target.
    fn exec_command(&self, env: &EnvironmentHandle, invocation: &ShellInvocation) -> (Command, KillTarget) {
        let pid_file = format!("/tmp/.shellbox-{}.pid", uuid::Uuid::new_v4().simple());
        let mut command = Command::new(&self.docker_bin);
        command.args(exec_args(&env.id, &pid_file, invocation));
        let target = KillTarget::Container {
            docker_bin: self.docker_bin.clone(),
            container: env.id.clone(),
            pid_file,
        };
        (command, target)
    }
}

fn run_args(name: &str, spec: &EnvironmentSpec) -> Vec<String> {
    [
        "run",
        "-d",
        "--rm",
        "--name",
        name,
        "--network",
        spec.network.as_str(),
        "--memory",
        spec.memory.as_str(),
        "--cpus",
        spec.cpus.as_str(),
        spec.image.as_str(),
        "sleep",
        "infinity",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn exec_args(container: &str, pid_file: &str, invocation: &ShellInvocation) -> Vec<String> {
    let script = format!(
        "echo $$ > {pid_file}; trap 'rm -f {pid_file}' EXIT; {}",
        invocation.script()
    );
    vec![
        "exec".to_string(),
        container.to_string(),
        "sh".to_string(),
        "-c".to_string(),
        script,
    ]
}

fn is_missing_container(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("is not running")
}

/// `docker exec` reports its own failures on stderr with a daemon prefix; any
/// other non-zero exit belongs to the user's command.
fn daemon_failure(container: &str, stderr: &str) -> Option<RuntimeError> {
    let stderr = stderr.trim_start();
    if !stderr.starts_with(DAEMON_ERROR_PREFIX) {
        return None;
    }
    if is_missing_container(stderr) {
        Some(RuntimeError::EnvironmentGone(container.to_string()))
    } else {
        Some(RuntimeError::Io(std::io::Error::other(stderr.trim().to_string())))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create(&self, spec: &EnvironmentSpec) -> Result<EnvironmentHandle, RuntimeError> {
        let name = format!("{CONTAINER_PREFIX}{}", uuid::Uuid::new_v4().simple());
        info!(container = %name, image = %spec.image, "Starting container");

        let output = self.docker(&run_args(&name, spec)).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::Create(format!("docker run failed: {}", stderr.trim())));
        }

        let mkdir = ["exec", name.as_str(), "mkdir", "-p", self.home_dir.as_str()].map(String::from);
        let output = self.docker(&mkdir).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let handle = EnvironmentHandle {
                id: name,
                home: self.home_dir.clone(),
            };
            if let Err(e) = self.destroy(&handle).await {
                warn!(error = %e, "Failed to remove half-created container");
            }
            return Err(RuntimeError::Create(format!("mkdir {}: {}", self.home_dir, stderr)));
        }

        Ok(EnvironmentHandle {
            id: name,
            home: self.home_dir.clone(),
        })
    }

    async fn run(
        &self,
        env: &EnvironmentHandle,
        invocation: &ShellInvocation,
        timeout: Duration,
    ) -> Result<RunOutcome, RuntimeError> {
        let (command, target) = self.exec_command(env, invocation);
        let outcome = run_to_completion(command, target, timeout, self.max_output).await?;
        if let RunOutcome::Completed(output) = &outcome {
            if !output.success() {
                if let Some(err) = daemon_failure(&env.id, &output.stderr) {
                    return Err(err);
                }
            }
        }
        Ok(outcome)
    }

    async fn spawn(
        &self,
        env: &EnvironmentHandle,
        invocation: &ShellInvocation,
    ) -> Result<ProcessHandle, RuntimeError> {
        let (command, target) = self.exec_command(env, invocation);
        spawn_streaming(command, target)
    }

    async fn destroy(&self, env: &EnvironmentHandle) -> Result<(), RuntimeError> {
        let output = self.docker(&["rm", "-f", env.id.as_str()].map(String::from)).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() || is_missing_container(&stderr) {
            info!(container = %env.id, "Container removed");
            return Ok(());
        }
        Err(RuntimeError::Destroy {
            id: env.id.clone(),
            message: stderr.trim().to_string(),
        })
    }
}
