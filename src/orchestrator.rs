//! Session lifecycle and command execution on top of a [`ContainerRuntime`].

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::error::{OrchestratorError, RuntimeError};
use crate::registry::{Registry, RetireReason, Session, SessionView};
use crate::runtime::{
    shell_quote, CommandOutput, ContainerRuntime, EnvironmentSpec, ProcessEvent, ProcessHandle,
    RunOutcome, ShellInvocation,
};

/// Largest file accepted for upload. The payload travels base64-encoded
/// inside a single shell argument.
pub const MAX_FILE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// Output of the user's command, whatever its exit status.
    Output(CommandOutput),
    /// A `cd` that resolved; produces no output.
    Navigated,
    /// A `cd` whose target did not resolve; the directory is unchanged.
    NavigationFailed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    /// Working directory after the command.
    pub working_directory: String,
    pub result: ExecutionResult,
}

pub struct Orchestrator {
    registry: Registry,
    runtime: Arc<dyn ContainerRuntime>,
    spec: EnvironmentSpec,
    command_timeout: Duration,
}

impl Orchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, spec: EnvironmentSpec, sessions: &SessionConfig) -> Self {
        Self {
            registry: Registry::new(sessions.max_sessions),
            runtime,
            spec,
            command_timeout: sessions.command_timeout(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Create a session, evicting the least-recently-active one first if
    /// the registry is full.
    pub async fn create_session(&self) -> Result<SessionView, OrchestratorError> {
        let (reservation, evicted) = self.registry.reserve()?;
        for session in evicted {
            self.retire(session, RetireReason::Evicted);
        }

        // Detached from the caller so a dropped request cannot strand a
        // freshly created environment outside the registry.
        let runtime = self.runtime.clone();
        let registry = self.registry.clone();
        let spec = self.spec.clone();
        let created = tokio::spawn(async move {
            let environment = runtime.create(&spec).await?;
            Ok::<_, RuntimeError>(registry.admit(reservation, environment))
        })
        .await
        .map_err(|e| RuntimeError::Io(std::io::Error::other(e.to_string())))?;

        match created {
            Ok(session) => {
                info!(session_id = %session.id, environment = %session.environment.id, "Created session");
                Ok(session)
            }
            Err(e) => {
                error!(error = %e, "Failed to create session environment");
                Err(e.into())
            }
        }
    }

    /// Look a session up without counting it as activity.
    pub fn session(&self, id: &str) -> Result<SessionView, OrchestratorError> {
        self.registry
            .get(id)
            .ok_or_else(|| OrchestratorError::SessionNotFound(id.to_string()))
    }

    pub fn sessions(&self) -> Vec<SessionView> {
        self.registry.list()
    }

    /// Run `command` in the session's working directory, or emulate it when
    /// it is a plain `cd`.
    pub async fn execute(&self, id: &str, command: &str) -> Result<Execution, OrchestratorError> {
        let session = self.registry.touch(id)?;
        if let Some(target) = parse_cd(command) {
            return self.change_directory(session, &target).await;
        }

        debug!(session_id = %id, command = %command, "Executing");
        let invocation = ShellInvocation::new(&session.working_directory, command);
        let output = self.run(&session, &invocation).await?;
        Ok(Execution {
            working_directory: session.working_directory,
            result: ExecutionResult::Output(output),
        })
    }

    async fn change_directory(&self, session: SessionView, target: &str) -> Result<Execution, OrchestratorError> {
        if let Some(message) = unsupported_cd(target) {
            return Ok(Execution {
                working_directory: session.working_directory,
                result: ExecutionResult::NavigationFailed { message },
            });
        }
        let _navigating = session.navigation.lock().await;
        // Re-read under the lock: an earlier `cd` may have just landed.
        let current = self.session(&session.id)?;
        let script = format!("cd {} && pwd", cd_operand(target, &current.environment.home));
        let invocation = ShellInvocation::new(&current.working_directory, script);
        let output = self.run(&current, &invocation).await?;

        let resolved = output.stdout.lines().last().map(str::trim).unwrap_or_default();
        if !output.success() || !resolved.starts_with('/') {
            let message = match output.stderr.trim() {
                "" => format!("cd: {target}: No such file or directory"),
                stderr => stderr.to_string(),
            };
            debug!(session_id = %session.id, target = %target, "Directory change failed");
            return Ok(Execution {
                working_directory: current.working_directory,
                result: ExecutionResult::NavigationFailed { message },
            });
        }

        let resolved = resolved.to_string();
        self.registry.set_working_directory(&session.id, resolved.clone())?;
        debug!(session_id = %session.id, cwd = %resolved, "Changed directory");
        Ok(Execution {
            working_directory: resolved,
            result: ExecutionResult::Navigated,
        })
    }

    /// Bounded run. A timeout is reported with the output gathered so far.
    async fn run(&self, session: &SessionView, invocation: &ShellInvocation) -> Result<CommandOutput, OrchestratorError> {
        let outcome = self
            .runtime
            .run(&session.environment, invocation, self.command_timeout)
            .await
            .map_err(|e| self.runtime_failure(&session.id, e))?;
        match outcome {
            RunOutcome::Completed(output) => Ok(output),
            RunOutcome::TimedOut(output) => {
                warn!(session_id = %session.id, limit = ?self.command_timeout, "Command timed out");
                Err(OrchestratorError::Timeout {
                    limit: self.command_timeout,
                    output,
                })
            }
        }
    }

    /// A runtime error against a session that was destroyed meanwhile is
    /// reported as the session being gone.
    fn runtime_failure(&self, id: &str, err: RuntimeError) -> OrchestratorError {
        if !self.registry.contains(id) {
            debug!(session_id = %id, error = %err, "Session destroyed during runtime call");
            return OrchestratorError::SessionNotFound(id.to_string());
        }
        error!(session_id = %id, error = %err, "Runtime failure");
        err.into()
    }

    /// Launch `command` without waiting for it. Launch failures and the
    /// eventual exit status only reach the log.
    pub fn execute_detached(&self, id: &str, command: &str) -> Result<(), OrchestratorError> {
        let session = self.registry.touch(id)?;
        let invocation = ShellInvocation::new(&session.working_directory, command);
        let runtime = self.runtime.clone();
        let session_id = session.id.clone();
        tokio::spawn(async move {
            let mut process = match runtime.spawn(&session.environment, &invocation).await {
                Ok(process) => process,
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Failed to launch detached command");
                    return;
                }
            };
            while let Some(event) = process.next_event().await {
                if let ProcessEvent::Exited { code } = event {
                    debug!(session_id = %session_id, exit_code = ?code, "Detached command finished");
                    break;
                }
            }
        });
        Ok(())
    }

    /// Spawn `command` for streaming. Dropping the handle kills the process.
    pub async fn open_stream(&self, id: &str, command: &str) -> Result<ProcessHandle, OrchestratorError> {
        let session = self.registry.touch(id)?;
        let invocation = ShellInvocation::new(&session.working_directory, command);
        info!(session_id = %id, command = %command, "Opening stream");
        self.runtime
            .spawn(&session.environment, &invocation)
            .await
            .map_err(|e| self.runtime_failure(id, e))
    }

    /// Entries matching `partial*` relative to the working directory. Any
    /// resolution problem yields no candidates.
    pub async fn complete(&self, id: &str, partial: &str) -> Result<Vec<String>, OrchestratorError> {
        let session = self.registry.touch(id)?;
        let script = format!("ls -1dp -- {}* 2>/dev/null", shell_quote(partial));
        let invocation = ShellInvocation::new(&session.working_directory, script);
        let output = match self
            .runtime
            .run(&session.environment, &invocation, self.command_timeout)
            .await
        {
            Ok(RunOutcome::Completed(output)) if output.success() => output,
            Ok(_) => return Ok(Vec::new()),
            Err(e) => {
                debug!(session_id = %id, error = %e, "Completion lookup failed");
                return Ok(Vec::new());
            }
        };
        let mut candidates: Vec<String> = output
            .stdout
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();
        candidates.sort();
        candidates.dedup();
        Ok(candidates)
    }

    /// Write `content` to `path` (relative to the working directory).
    /// The inner result carries the shell's complaint on failure.
    pub async fn write_file(
        &self,
        id: &str,
        path: &str,
        content: &[u8],
    ) -> Result<Result<(), String>, OrchestratorError> {
        if content.len() > MAX_FILE_BYTES {
            return Err(OrchestratorError::InvalidRequest(format!(
                "file exceeds {MAX_FILE_BYTES} bytes"
            )));
        }
        let session = self.registry.touch(id)?;
        let script = format!(
            "printf '%s' {} | base64 -d > {}",
            shell_quote(&BASE64.encode(content)),
            shell_quote(path)
        );
        let invocation = ShellInvocation::new(&session.working_directory, script);
        let output = self.run(&session, &invocation).await?;
        if output.success() {
            Ok(Ok(()))
        } else {
            Ok(Err(failure_message(&output, path)))
        }
    }

    /// Read `path` (relative to the working directory).
    pub async fn read_file(&self, id: &str, path: &str) -> Result<Result<Vec<u8>, String>, OrchestratorError> {
        let session = self.registry.touch(id)?;
        let script = format!("base64 < {}", shell_quote(path));
        let invocation = ShellInvocation::new(&session.working_directory, script);
        let output = self.run(&session, &invocation).await?;
        if !output.success() {
            return Ok(Err(failure_message(&output, path)));
        }
        let encoded: String = output.stdout.split_whitespace().collect();
        Ok(BASE64
            .decode(encoded)
            .map_err(|e| format!("{path}: unreadable transfer: {e}")))
    }

    /// Explicit termination. Waits for the environment teardown, whose
    /// failure is logged rather than returned.
    pub async fn terminate(&self, id: &str) -> Result<(), OrchestratorError> {
        let session = self
            .registry
            .remove(id)
            .ok_or_else(|| OrchestratorError::SessionNotFound(id.to_string()))?;
        if let Err(e) = self.retire(session, RetireReason::Terminated).await {
            error!(session_id = %id, error = %e, "Destroy task failed");
        }
        Ok(())
    }

    /// Destroy every session past the inactivity or lifetime limit at `now`.
    pub fn sweep(&self, now: Instant, inactivity: Duration, lifetime: Duration) -> usize {
        let expired = self.registry.take_expired(now, inactivity, lifetime);
        let count = expired.len();
        for (session, reason) in expired {
            self.retire(session, reason);
        }
        count
    }

    /// The single destruction path: the session is already out of the
    /// registry, so its environment is destroyed exactly once.
    fn retire(&self, session: Session, reason: RetireReason) -> JoinHandle<()> {
        info!(session_id = %session.id, environment = %session.environment.id, %reason, "Destroying session");
        let runtime = self.runtime.clone();
        tokio::spawn(async move {
            if let Err(e) = runtime.destroy(&session.environment).await {
                error!(session_id = %session.id, error = %e, "Failed to destroy environment");
            }
        })
    }
}

fn failure_message(output: &CommandOutput, path: &str) -> String {
    match output.stderr.trim() {
        "" => format!("{path}: exit status {:?}", output.exit_code),
        stderr => stderr.to_string(),
    }
}

/// Recognize a standalone `cd` and return its target (empty for bare `cd`).
/// Compound commands such as `cd x && make` run as ordinary commands.
fn parse_cd(command: &str) -> Option<String> {
    let command = command.trim();
    let rest = command.strip_prefix("cd")?;
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let rest = rest.trim();
    if rest.is_empty() {
        return Some(String::new());
    }
    for quote in ['\'', '"'] {
        if let Some(inner) = rest.strip_prefix(quote).and_then(|r| r.strip_suffix(quote)) {
            if !inner.contains(quote) {
                return Some(inner.to_string());
            }
        }
    }
    let special = |c: char| c.is_whitespace() || ";&|<>()`$\\'\"*?".contains(c);
    if rest.contains(special) {
        return None;
    }
    Some(rest.to_string())
}

/// `cd -` and option flags would need shell state that is not kept
/// between commands.
fn unsupported_cd(target: &str) -> Option<String> {
    match target {
        "-" => Some("cd: -: previous directory is not tracked".to_string()),
        t if t.starts_with('-') => Some(format!("cd: {t}: options are not supported")),
        _ => None,
    }
}

/// Shell operand for a `cd` target, expanding `~` against the environment home.
fn cd_operand(target: &str, home: &str) -> String {
    match target {
        "" | "~" => shell_quote(home),
        _ => match target.strip_prefix("~/") {
            Some(rest) => shell_quote(&format!("{}/{}", home.trim_end_matches('/'), rest)),
            None => shell_quote(target),
        },
    }
}
