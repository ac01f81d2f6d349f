//! Runs a spawned child to completion under a deadline.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{CommandSpec, ProcessError, SpawnedProcess, spawn};

/// Upper bound on bytes kept per output stream. Anything beyond is drained
/// and dropped so the child never blocks on a full pipe.
pub const MAX_CAPTURED_OUTPUT: usize = 16 * 1024 * 1024;

/// Output of a process that ran to exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOutput {
    /// Exit code; `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    /// Captured stdout, lossily decoded.
    pub stdout: String,
    /// Captured stderr, lossily decoded.
    pub stderr: String,
}

impl RawOutput {
    /// True when the process exited with code 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

enum Settled {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Spawns `spec` and waits for it to exit, the deadline to pass, or `cancel`
/// to fire, whichever comes first.
///
/// On deadline or cancellation the child is killed and reaped before this
/// returns, and any partial output is discarded. The deadline also covers
/// draining stdout and stderr after the child exits, so a background
/// process holding an inherited pipe cannot stretch the call.
///
/// # Errors
///
/// Spawn errors from [`spawn`], `ProcessError::Timeout`,
/// `ProcessError::Cancelled`, or `ProcessError::Io` when waiting on the
/// child or reading its pipes fails.
pub async fn run_to_completion(
    spec: &CommandSpec,
    timeout: Duration,
    cancel: Option<&CancellationToken>,
) -> Result<RawOutput, ProcessError> {
    let deadline = Instant::now() + timeout;
    let SpawnedProcess { mut child, pid } = spawn(spec)?;
    debug!(pid, command = %spec.display(), "spawned child process");

    let stdout_task = tokio::spawn(read_capped(child.stdout.take()));
    let stderr_task = tokio::spawn(read_capped(child.stderr.take()));

    let settled = tokio::select! {
        status = child.wait() => Settled::Exited(status),
        () = tokio::time::sleep_until(deadline) => Settled::TimedOut,
        () = cancelled(cancel) => Settled::Cancelled,
    };

    match settled {
        Settled::Exited(status) => {
            let status = status.map_err(|e| ProcessError::Io(e.to_string()))?;

            // A backgrounded grandchild can keep the pipes open past the
            // child's exit; the deadline still bounds the drain.
            let stdout_abort = stdout_task.abort_handle();
            let stderr_abort = stderr_task.abort_handle();
            let drain = async {
                Ok::<_, ProcessError>((join_pipe(stdout_task).await?, join_pipe(stderr_task).await?))
            };
            let drained: Result<(Vec<u8>, Vec<u8>), ProcessError> = tokio::select! {
                pipes = drain => pipes,
                () = tokio::time::sleep_until(deadline) => Err(ProcessError::Timeout { timeout }),
                () = cancelled(cancel) => Err(ProcessError::Cancelled),
            };
            if drained.is_err() {
                stdout_abort.abort();
                stderr_abort.abort();
            }
            if matches!(drained, Err(ProcessError::Timeout { .. })) {
                warn!(pid, "output pipes still open at deadline after child exit");
            }
            let (stdout, stderr) = drained?;
            Ok(RawOutput {
                exit_code: status.code(),
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            })
        },
        Settled::TimedOut => {
            kill_and_reap(&mut child, pid, stdout_task, stderr_task).await;
            Err(ProcessError::Timeout { timeout })
        },
        Settled::Cancelled => {
            kill_and_reap(&mut child, pid, stdout_task, stderr_task).await;
            Err(ProcessError::Cancelled)
        },
    }
}

async fn kill_and_reap(
    child: &mut tokio::process::Child,
    pid: u32,
    stdout_task: JoinHandle<std::io::Result<Vec<u8>>>,
    stderr_task: JoinHandle<std::io::Result<Vec<u8>>>,
) {
    // Grandchildren may still hold the pipes open; don't wait on readers.
    stdout_task.abort();
    stderr_task.abort();

    if let Err(e) = child.start_kill() {
        warn!(pid, "failed to kill child process: {e}");
    }
    if let Err(e) = child.wait().await {
        warn!(pid, "failed to reap child process: {e}");
    }
    debug!(pid, "child process killed");
}

async fn cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn read_capped<R>(pipe: Option<R>) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let Some(mut pipe) = pipe else {
        return Ok(Vec::new());
    };
    let mut buf = Vec::new();
    (&mut pipe)
        .take(MAX_CAPTURED_OUTPUT as u64)
        .read_to_end(&mut buf)
        .await?;
    tokio::io::copy(&mut pipe, &mut tokio::io::sink()).await?;
    Ok(buf)
}

async fn join_pipe(
    task: JoinHandle<std::io::Result<Vec<u8>>>,
) -> Result<Vec<u8>, ProcessError> {
    task.await
        .map_err(|e| ProcessError::Io(e.to_string()))?
        .map_err(|e| ProcessError::Io(e.to_string()))
}
