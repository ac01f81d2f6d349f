//! Execution seam between the supervisor and the operating system.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::process::{CommandSpec, ProcessError, RawOutput, run_to_completion};

/// Runs one command to completion.
///
/// Implementations must kill the child when `timeout` passes or `cancel`
/// fires, and must never route `spec` through a shell.
#[async_trait]
pub trait CommandExecutor: Send + Sync + fmt::Debug {
    /// Execute `spec`.
    async fn execute(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<RawOutput, ProcessError>;
}

/// Production executor backed by `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioExecutor;

#[async_trait]
impl CommandExecutor for TokioExecutor {
    async fn execute(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<RawOutput, ProcessError> {
        run_to_completion(spec, timeout, cancel).await
    }
}

/// A scripted reply for [`MockExecutor`].
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Exit with `code`, printing `stdout` and `stderr`.
    Exit {
        /// Exit code.
        code: i32,
        /// Stdout contents.
        stdout: String,
        /// Stderr contents.
        stderr: String,
    },
    /// The binary does not exist.
    NotFound,
    /// Run past the deadline.
    Hang,
}

impl MockReply {
    /// Exit 0 with `stdout`.
    #[must_use]
    pub fn stdout(stdout: impl Into<String>) -> Self {
        Self::Exit {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Exit with a non-zero `code` and `stderr`.
    #[must_use]
    pub fn fail(code: i32, stderr: impl Into<String>) -> Self {
        Self::Exit {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// In-memory executor for tests.
///
/// Replies are consumed in order; once the script runs out the fallback
/// reply is used for every further call. Each call counts as one spawn and
/// its argv is recorded.
#[derive(Debug)]
pub struct MockExecutor {
    script: Mutex<VecDeque<MockReply>>,
    fallback: MockReply,
    latency: Duration,
    spawns: AtomicUsize,
    calls: Mutex<Vec<Vec<String>>>,
}

impl MockExecutor {
    /// Every call gets `reply`.
    #[must_use]
    pub fn always(reply: MockReply) -> Self {
        Self::scripted(Vec::new(), reply)
    }

    /// Calls get `script` in order, then `fallback`.
    #[must_use]
    pub fn scripted(script: Vec<MockReply>, fallback: MockReply) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            latency: Duration::ZERO,
            spawns: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Delay every completed call by `latency`.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Number of processes "spawned" so far.
    #[must_use]
    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Argv of every call, in execution order.
    #[must_use]
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn next_reply(&self) -> MockReply {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl CommandExecutor for MockExecutor {
    async fn execute(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<RawOutput, ProcessError> {
        let reply = self.next_reply();
        if matches!(reply, MockReply::NotFound) {
            return Err(ProcessError::BinaryNotFound {
                program: spec.program.to_string_lossy().into_owned(),
            });
        }

        self.spawns.fetch_add(1, Ordering::SeqCst);
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(spec.args.clone());

        let wait = match reply {
            MockReply::Hang => timeout,
            _ => self.latency.min(timeout),
        };
        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            () = tokio::time::sleep(wait) => {},
            () = cancelled => return Err(ProcessError::Cancelled),
        }

        match reply {
            MockReply::Exit {
                code,
                stdout,
                stderr,
            } => Ok(RawOutput {
                exit_code: Some(code),
                stdout,
                stderr,
            }),
            MockReply::Hang => Err(ProcessError::Timeout { timeout }),
            MockReply::NotFound => Err(ProcessError::BinaryNotFound {
                program: spec.program.to_string_lossy().into_owned(),
            }),
        }
    }
}
