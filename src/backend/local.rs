//! Local process backend.
//!
//! Spawns the child directly on the host in its own process group. On timeout
//! the whole group is killed so background jobs started by the code do not
//! outlive the request.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use super::{Invocation, ProcessBackend, RunOutcome};

/// How long to wait for the output pipes to drain after killing a timed-out
/// process group.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Backend that runs processes directly on the host.
#[derive(Debug, Default, Clone)]
pub struct LocalBackend {}

impl LocalBackend {
    /// Create a new local backend.
    #[must_use]
    pub const fn new() -> Self {
        Self {}
    }
}

#[async_trait]
impl ProcessBackend for LocalBackend {
    #[instrument(skip(self, invocation), fields(program = %invocation.program.display(), timeout = ?timeout))]
    async fn run(&self, invocation: &Invocation, timeout: Duration) -> RunOutcome {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .process_group(0)
            .kill_on_drop(true);

        if let Some(cwd) = &invocation.cwd {
            cmd.current_dir(cwd);
        }
        if let Some(env) = &invocation.env {
            cmd.env_clear().envs(env);
        }
        if invocation.capture_output {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(cause) => return RunOutcome::SpawnFailed { cause },
        };
        // The child leads its own group (process_group(0)), so its pid is the
        // group id. `id()` is gone once the leader is reaped; jobs in the group
        // can outlive it.
        let group = child
            .id()
            .and_then(|pid| i32::try_from(pid).ok())
            .map(Pid::from_raw);

        let mut stdout = Capture::spawn(child.stdout.take(), invocation.output_limit);
        let mut stderr = Capture::spawn(child.stderr.take(), invocation.output_limit);

        // Wait for exit and for both pipes to close, all under the timeout.
        // Pipes stay open while a background job still holds them.
        let waited = tokio::time::timeout(timeout, async {
            let status = child.wait().await;
            stdout.finish().await;
            stderr.finish().await;
            status
        })
        .await;

        match waited {
            Ok(Ok(status)) => {
                let exit_code = exit_code(status);
                debug!(exit_code, "Process completed");
                RunOutcome::Completed {
                    exit_code,
                    stdout: stdout.into_string(),
                    stderr: stderr.into_string(),
                }
            }
            Ok(Err(cause)) => RunOutcome::SpawnFailed { cause },
            Err(_) => {
                debug!("Process timed out, killing process group");
                terminate(&mut child, group).await;

                let _ = tokio::time::timeout(DRAIN_GRACE, async {
                    stdout.finish().await;
                    stderr.finish().await;
                })
                .await;
                stdout.abort();
                stderr.abort();

                RunOutcome::TimedOut {
                    stdout: stdout.into_string(),
                    stderr: stderr.into_string(),
                }
            }
        }
    }
}

/// Exit code, or `128 + signal` for a child killed by a signal.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

/// Kill the child's process group, then the child itself, and reap it.
async fn terminate(child: &mut Child, group: Option<Pid>) {
    if let Some(group) = group {
        if let Err(e) = killpg(group, Signal::SIGKILL) {
            debug!(pgid = group.as_raw(), error = %e, "killpg failed");
        }
    }
    if let Err(e) = child.kill().await {
        debug!(error = %e, "kill after killpg failed");
    }
    if let Err(e) = child.wait().await {
        warn!(error = %e, "Failed to reap timed-out process");
    }
}

/// Background reader for one output pipe.
struct Capture {
    task: Option<JoinHandle<io::Result<Vec<u8>>>>,
    bytes: Vec<u8>,
}

impl Capture {
    fn spawn<R>(reader: Option<R>, limit: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        Self {
            task: reader.map(|r| tokio::spawn(read_capped(r, limit))),
            bytes: Vec::new(),
        }
    }

    /// Wait for the reader to hit EOF. Safe to call again after a timeout
    /// interrupted a previous call.
    async fn finish(&mut self) {
        let Some(task) = self.task.as_mut() else {
            return;
        };
        let result = task.await;
        self.task = None;
        match result {
            Ok(Ok(bytes)) => self.bytes = bytes,
            Ok(Err(e)) => warn!(error = %e, "Failed to read process output"),
            Err(e) => warn!(error = %e, "Output reader task failed"),
        }
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn into_string(self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Read to EOF, keeping at most `limit` bytes. Reading continues past the
/// limit so the child never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> io::Result<Vec<u8>> {
    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(kept);
        }
        let room = limit.saturating_sub(kept.len());
        kept.extend_from_slice(&chunk[..n.min(room)]);
    }
}
