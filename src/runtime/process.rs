//! Child-process plumbing shared by the runtime backends.

use std::collections::HashSet;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{CommandOutput, OutputStream, ProcessEvent, ProcessHandle, RunOutcome};
use crate::error::RuntimeError;

/// How long a reader may keep waiting on a pipe once the process is gone.
/// Bounds the wait when a backgrounded grandchild keeps a pipe open.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

const EVENT_BUFFER: usize = 64;
const READ_CHUNK: usize = 8192;
const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// Process groups launched on behalf of one environment.
#[derive(Debug, Clone, Default)]
pub(crate) struct ProcessGroups(Arc<Mutex<HashSet<i32>>>);

impl ProcessGroups {
    fn insert(&self, pgid: i32) {
        let Ok(mut groups) = self.0.lock() else { return };
        // Forget groups with no members left so their ids can be reused safely.
        groups.retain(|&g| group_alive(g));
        groups.insert(pgid);
    }

    /// SIGKILL every recorded group, including members that outlived
    /// their leader.
    pub(crate) fn kill_all(&self) -> usize {
        let groups: Vec<i32> = match self.0.lock() {
            Ok(mut groups) => groups.drain().collect(),
            Err(_) => return 0,
        };
        groups.into_iter().filter(|&g| kill_group(g)).count()
    }
}

#[cfg(unix)]
fn group_alive(pgid: i32) -> bool {
    nix::sys::signal::killpg(nix::unistd::Pid::from_raw(pgid), None).is_ok()
}

#[cfg(not(unix))]
fn group_alive(_pgid: i32) -> bool {
    false
}

#[cfg(unix)]
fn kill_group(pgid: i32) -> bool {
    use nix::sys::signal::{killpg, Signal};
    match killpg(nix::unistd::Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) => true,
        Err(e) => {
            debug!(pgid, error = %e, "killpg failed");
            false
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: i32) -> bool {
    false
}

/// What has to be signalled to really stop an invocation.
#[derive(Debug, Clone)]
pub(crate) enum KillTarget {
    /// The child leads its own process group, recorded in the set.
    Group(ProcessGroups),
    /// The child is a `docker exec` client; the real process lives in the
    /// container and recorded its pid in `pid_file`.
    Container {
        docker_bin: String,
        container: String,
        pid_file: String,
    },
}

impl KillTarget {
    async fn kill(&self, child: &mut Child) {
        match self {
            KillTarget::Group(_) => {
                if let Some(pid) = child.id() {
                    kill_group(pid as i32);
                }
            }
            KillTarget::Container {
                docker_bin,
                container,
                pid_file,
            } => {
                let script = format!(
                    "p=$(cat {pid_file} 2>/dev/null) && {{ pkill -KILL -P \"$p\"; kill -KILL \"$p\"; }}; rm -f {pid_file}"
                );
                let result = Command::new(docker_bin)
                    .args(["exec", container, "sh", "-c", &script])
                    .stdin(Stdio::null())
                    .output()
                    .await;
                if let Err(e) = result {
                    warn!(container = %container, error = %e, "failed to kill process inside container");
                }
            }
        }
        let _ = child.start_kill();
    }
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Captured {
    fn into_string(self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

/// Read everything, keeping at most `limit` bytes. Keeps draining past the
/// limit so the child never blocks on a full pipe.
async fn capture<R>(mut reader: R, sink: Arc<Mutex<Captured>>, limit: usize)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let Ok(mut captured) = sink.lock() else { break };
        let room = limit.saturating_sub(captured.bytes.len());
        if n > room {
            captured.truncated = true;
        }
        captured.bytes.extend_from_slice(&buf[..n.min(room)]);
    }
}

/// Wait up to [`DRAIN_GRACE`] for `task`, aborting it if it is still running.
async fn drain(task: Option<JoinHandle<()>>) {
    if let Some(mut task) = task {
        if tokio::time::timeout(DRAIN_GRACE, &mut task).await.is_err() {
            debug!("output reader still busy after grace period, aborting");
            task.abort();
        }
    }
}

fn take_captured(sink: &Arc<Mutex<Captured>>) -> String {
    sink.lock()
        .map(|mut captured| std::mem::take(&mut *captured))
        .unwrap_or_default()
        .into_string()
}

fn launch(command: &mut Command, target: &KillTarget) -> Result<Child, RuntimeError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    if matches!(target, KillTarget::Group(_)) {
        command.process_group(0);
    }
    let child = command.spawn().map_err(|source| RuntimeError::Launch {
        program: command.as_std().get_program().to_string_lossy().into_owned(),
        source,
    })?;
    if let (KillTarget::Group(groups), Some(pid)) = (target, child.id()) {
        groups.insert(pid as i32);
    }
    Ok(child)
}

/// Run `command` to completion or until `timeout`, capturing output.
pub(crate) async fn run_to_completion(
    mut command: Command,
    target: KillTarget,
    timeout: Duration,
    max_output: usize,
) -> Result<RunOutcome, RuntimeError> {
    let mut child = launch(&mut command, &target)?;

    let stdout_sink = Arc::new(Mutex::new(Captured::default()));
    let stderr_sink = Arc::new(Mutex::new(Captured::default()));
    let stdout_task = child
        .stdout
        .take()
        .map(|out| tokio::spawn(capture(out, stdout_sink.clone(), max_output)));
    let stderr_task = child
        .stderr
        .take()
        .map(|err| tokio::spawn(capture(err, stderr_sink.clone(), max_output)));

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => Some(status?),
        Err(_) => {
            target.kill(&mut child).await;
            let _ = child.wait().await;
            None
        }
    };

    drain(stdout_task).await;
    drain(stderr_task).await;

    let output = CommandOutput {
        stdout: take_captured(&stdout_sink),
        stderr: take_captured(&stderr_sink),
        exit_code: status.and_then(|s| s.code()),
    };
    Ok(match status {
        Some(_) => RunOutcome::Completed(output),
        None => RunOutcome::TimedOut(output),
    })
}

/// Resolves [`DRAIN_GRACE`] after the process is reported gone.
async fn pipe_grace(exited: &mut watch::Receiver<bool>) {
    // A dropped sender means the supervisor is gone too.
    let _ = exited.wait_for(|gone| *gone).await;
    tokio::time::sleep(DRAIN_GRACE).await;
}

/// Forward chunks read from `reader`. Only waiting on the pipe is bounded
/// once the process has exited; handing a chunk to a slow subscriber is not.
async fn pump<R>(
    mut reader: R,
    stream: OutputStream,
    events: mpsc::Sender<ProcessEvent>,
    mut exited: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
            _ = pipe_grace(&mut exited) => {
                debug!(?stream, "pipe still open after process exit");
                break;
            }
        };
        let event = ProcessEvent::Output {
            stream,
            data: buf[..n].to_vec(),
        };
        if events.send(event).await.is_err() {
            break;
        }
    }
}

async fn join_pump(task: Option<JoinHandle<()>>) {
    if let Some(task) = task {
        let _ = task.await;
    }
}

/// Spawn `command` and forward its output as [`ProcessEvent`]s.
///
/// A supervisor task waits for either process exit or a kill request (an
/// explicit `kill()` or the handle being dropped). `Exited` is sent only
/// after both pumps have finished, so it is always the last event.
pub(crate) fn spawn_streaming(
    mut command: Command,
    target: KillTarget,
) -> Result<ProcessHandle, RuntimeError> {
    let mut child = launch(&mut command, &target)?;
    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
    let (kill_tx, kill_rx) = oneshot::channel::<()>();
    let (exited_tx, exited_rx) = watch::channel(false);

    let stdout_task = child.stdout.take().map(|out| {
        tokio::spawn(pump(out, OutputStream::Stdout, events_tx.clone(), exited_rx.clone()))
    });
    let stderr_task = child.stderr.take().map(|err| {
        tokio::spawn(pump(err, OutputStream::Stderr, events_tx.clone(), exited_rx.clone()))
    });

    tokio::spawn(async move {
        let exited = tokio::select! {
            status = child.wait() => Some(status.ok().and_then(|s| s.code())),
            _ = kill_rx => None,
        };
        let _ = exited_tx.send(true);
        let code = match exited {
            Some(code) => {
                join_pump(stdout_task).await;
                join_pump(stderr_task).await;
                code
            }
            None => {
                debug!("killing streamed process");
                target.kill(&mut child).await;
                let _ = child.wait().await;
                drain(stdout_task).await;
                drain(stderr_task).await;
                None
            }
        };
        let _ = events_tx.send(ProcessEvent::Exited { code }).await;
    });

    Ok(ProcessHandle::new(events_rx, kill_tx))
}
