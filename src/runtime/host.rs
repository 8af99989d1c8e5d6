//! Host-process backend for development and tests.
//!
//! Each environment is a plain directory under the configured root with a
//! `home` subdirectory. Commands run as `sh -c` on the host in their own
//! process group; destroying an environment kills every group it launched.
//! There is no isolation of any kind here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use super::process::{run_to_completion, spawn_streaming, KillTarget, ProcessGroups};
use super::{
    ContainerRuntime, EnvironmentHandle, EnvironmentSpec, ProcessHandle, RunOutcome,
    ShellInvocation,
};
use crate::error::RuntimeError;

pub struct HostRuntime {
    root: PathBuf,
    max_output: usize,
    groups: Mutex<HashMap<String, ProcessGroups>>,
}

impl HostRuntime {
    pub fn new(root: impl Into<PathBuf>, max_output: usize) -> Self {
        Self {
            root: root.into(),
            max_output,
            groups: Mutex::new(HashMap::new()),
        }
    }

    fn environment_dir(&self, env: &EnvironmentHandle) -> Result<PathBuf, RuntimeError> {
        if env.id.is_empty() || env.id.contains(['/', '.']) {
            return Err(RuntimeError::EnvironmentGone(env.id.clone()));
        }
        Ok(self.root.join(&env.id))
    }

    fn kill_target(&self, env: &EnvironmentHandle) -> KillTarget {
        let groups = match self.groups.lock() {
            Ok(mut map) => map.entry(env.id.clone()).or_default().clone(),
            Err(_) => ProcessGroups::default(),
        };
        KillTarget::Group(groups)
    }

    fn shell(&self, env: &EnvironmentHandle, invocation: &ShellInvocation) -> Result<Command, RuntimeError> {
        let dir = self.environment_dir(env)?;
        if !dir.is_dir() {
            return Err(RuntimeError::EnvironmentGone(env.id.clone()));
        }
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(invocation.script())
            .current_dir(&env.home)
            .env("HOME", &env.home);
        Ok(command)
    }
}

async fn remove_environment_dir(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[async_trait]
impl ContainerRuntime for HostRuntime {
    fn name(&self) -> &'static str {
        "host"
    }

    async fn create(&self, _spec: &EnvironmentSpec) -> Result<EnvironmentHandle, RuntimeError> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let home = self.root.join(&id).join("home");
        tokio::fs::create_dir_all(&home)
            .await
            .map_err(|e| RuntimeError::Create(format!("mkdir {}: {}", home.display(), e)))?;
        let home = tokio::fs::canonicalize(&home)
            .await
            .map_err(|e| RuntimeError::Create(format!("resolve {}: {}", home.display(), e)))?;
        info!(environment = %id, home = %home.display(), "Created host environment");
        Ok(EnvironmentHandle {
            id,
            home: home.to_string_lossy().into_owned(),
        })
    }

    async fn run(
        &self,
        env: &EnvironmentHandle,
        invocation: &ShellInvocation,
        timeout: Duration,
    ) -> Result<RunOutcome, RuntimeError> {
        let command = self.shell(env, invocation)?;
        run_to_completion(command, self.kill_target(env), timeout, self.max_output).await
    }

    async fn spawn(
        &self,
        env: &EnvironmentHandle,
        invocation: &ShellInvocation,
    ) -> Result<ProcessHandle, RuntimeError> {
        let command = self.shell(env, invocation)?;
        spawn_streaming(command, self.kill_target(env))
    }

    async fn destroy(&self, env: &EnvironmentHandle) -> Result<(), RuntimeError> {
        let dir = self.environment_dir(env)?;
        let groups = self.groups.lock().ok().and_then(|mut map| map.remove(&env.id));
        if let Some(groups) = groups {
            let killed = groups.kill_all();
            if killed > 0 {
                info!(environment = %env.id, killed, "Killed leftover process groups");
            }
        }
        remove_environment_dir(&dir)
            .await
            .map_err(|e| RuntimeError::Destroy {
                id: env.id.clone(),
                message: e.to_string(),
            })?;
        info!(environment = %env.id, "Removed host environment");
        Ok(())
    }
}
