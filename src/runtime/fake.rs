//! In-memory runtime for tests: no processes, every call recorded.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::{
    CommandOutput, ContainerRuntime, EnvironmentHandle, EnvironmentSpec, OutputStream,
    ProcessEvent, ProcessHandle, RunOutcome, ShellInvocation,
};
use crate::error::RuntimeError;

#[derive(Debug, Default)]
struct State {
    next_id: u32,
    live: HashSet<String>,
    destroyed: Vec<String>,
    invocations: Vec<ShellInvocation>,
    fail_create: bool,
    fail_destroy: bool,
    panic_destroy: bool,
    time_out: bool,
}

/// `run` echoes the command text back on stdout; `spawn` emits the command
/// text as one stdout chunk and exits with status 0.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Mutex<State>,
}

impl FakeRuntime {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn fail_create(&self, fail: bool) {
        self.state().fail_create = fail;
    }

    pub fn fail_destroy(&self, fail: bool) {
        self.state().fail_destroy = fail;
    }

    /// Make `destroy` panic, as a crashed teardown task would.
    pub fn panic_destroy(&self, panic: bool) {
        self.state().panic_destroy = panic;
    }

    pub fn time_out(&self, time_out: bool) {
        self.state().time_out = time_out;
    }

    /// Simulate the environment disappearing underneath a session.
    pub fn vanish(&self, id: &str) {
        self.state().live.remove(id);
    }

    pub fn live(&self) -> usize {
        self.state().live.len()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.state().destroyed.clone()
    }

    pub fn invocations(&self) -> Vec<ShellInvocation> {
        self.state().invocations.clone()
    }

    fn check_live(&self, env: &EnvironmentHandle) -> Result<(), RuntimeError> {
        if self.state().live.contains(&env.id) {
            Ok(())
        } else {
            Err(RuntimeError::EnvironmentGone(env.id.clone()))
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn create(&self, _spec: &EnvironmentSpec) -> Result<EnvironmentHandle, RuntimeError> {
        let mut state = self.state();
        if state.fail_create {
            return Err(RuntimeError::Create("image pull failed".into()));
        }
        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        state.live.insert(id.clone());
        Ok(EnvironmentHandle {
            id,
            home: "/home".into(),
        })
    }

    async fn run(
        &self,
        env: &EnvironmentHandle,
        invocation: &ShellInvocation,
        _timeout: Duration,
    ) -> Result<RunOutcome, RuntimeError> {
        self.check_live(env)?;
        let time_out = {
            let mut state = self.state();
            state.invocations.push(invocation.clone());
            state.time_out
        };
        let output = CommandOutput {
            stdout: format!("{}\n", invocation.command),
            stderr: String::new(),
            exit_code: if time_out { None } else { Some(0) },
        };
        Ok(if time_out {
            RunOutcome::TimedOut(output)
        } else {
            RunOutcome::Completed(output)
        })
    }

    async fn spawn(
        &self,
        env: &EnvironmentHandle,
        invocation: &ShellInvocation,
    ) -> Result<ProcessHandle, RuntimeError> {
        self.check_live(env)?;
        self.state().invocations.push(invocation.clone());
        let (tx, rx) = mpsc::channel(4);
        let (kill_tx, _kill_rx) = oneshot::channel();
        tx.try_send(ProcessEvent::Output {
            stream: OutputStream::Stdout,
            data: invocation.command.clone().into_bytes(),
        })
        .ok();
        tx.try_send(ProcessEvent::Exited { code: Some(0) }).ok();
        Ok(ProcessHandle::new(rx, kill_tx))
    }

    async fn destroy(&self, env: &EnvironmentHandle) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.destroyed.push(env.id.clone());
        if state.panic_destroy {
            drop(state);
            panic!("teardown of {} crashed", env.id);
        }
        if state.fail_destroy {
            return Err(RuntimeError::Destroy {
                id: env.id.clone(),
                message: "daemon unavailable".into(),
            });
        }
        state.live.remove(&env.id);
        Ok(())
    }
}
