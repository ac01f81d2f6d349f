//! Supervised invocation of the `gt` and `bd` CLIs.
//!
//! Every call goes through the same pipeline:
//!
//! 1. queue admission: at most `max_concurrent` processes run at once,
//!    further callers wait in FIFO order, and at most `max_queue_depth` may
//!    wait before calls are rejected with `queue_full`;
//! 2. the per-binary [`CircuitBreaker`] is consulted (after admission, so a
//!    caller that waited sees the current state);
//! 3. the command is executed through a [`CommandExecutor`] without a shell,
//!    under a deadline;
//! 4. the outcome is classified into a [`CliResult`].
//!
//! Nothing is retried here. See [`progressive`] for caller-side retries on
//! timeout.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, SemaphorePermit, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::breaker::{Admission, BreakerConfig, BreakerSnapshot, CircuitBreaker};
use crate::config::humantime_serde;
use crate::process::{Binary, CommandSpec, ProcessError, RawOutput};
use crate::result::{CliErrorKind, CliResult, NO_EXIT_CODE};

pub mod executor;
pub mod progressive;

pub use executor::{CommandExecutor, MockExecutor, MockReply, TokioExecutor};
pub use progressive::{
    TimeoutPolicy, run_text_with_progressive_timeout, run_with_progressive_timeout,
};

/// Supervisor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Path to the `gt` binary.
    #[serde(default = "default_gt_path")]
    pub gt_path: PathBuf,

    /// Path to the `bd` binary.
    #[serde(default = "default_bd_path")]
    pub bd_path: PathBuf,

    /// Deadline applied when a call does not set its own.
    #[serde(default = "default_timeout")]
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,

    /// Maximum number of processes running at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Maximum number of callers waiting for a slot.
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,

    /// Working directory used when a call does not set its own.
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Extra environment for every child.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Circuit breaker settings, applied to each binary separately.
    #[serde(default)]
    pub breaker: BreakerConfig,
}

fn default_gt_path() -> PathBuf {
    PathBuf::from("gt")
}

fn default_bd_path() -> PathBuf {
    PathBuf::from("bd")
}

const fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_max_concurrent() -> usize {
    4
}

const fn default_max_queue_depth() -> usize {
    64
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            gt_path: default_gt_path(),
            bd_path: default_bd_path(),
            default_timeout: default_timeout(),
            max_concurrent: default_max_concurrent(),
            max_queue_depth: default_max_queue_depth(),
            cwd: None,
            env: BTreeMap::new(),
            breaker: BreakerConfig::default(),
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Deadline override.
    pub timeout: Option<Duration>,
    /// Working directory override.
    pub cwd: Option<PathBuf>,
    /// Cancels the call while queued or running.
    pub cancel: Option<CancellationToken>,
}

impl InvokeOptions {
    /// Options with a deadline override.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }
}

/// Queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Processes currently running.
    pub in_flight: usize,
    /// Callers waiting for a slot.
    pub queued: usize,
    /// Configured concurrency ceiling.
    pub max_concurrent: usize,
    /// Configured queue bound.
    pub max_queue_depth: usize,
    /// Invocations that reached execution.
    pub total_started: u64,
    /// Invocations that finished execution.
    pub total_completed: u64,
    /// Calls rejected because the queue was full.
    pub total_rejected: u64,
}

/// Breaker snapshots, one per binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerStats {
    /// Breaker guarding `gt`.
    pub gt: BreakerSnapshot,
    /// Breaker guarding `bd`.
    pub bd: BreakerSnapshot,
}

/// Snapshot returned by [`ProcessSupervisor::stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorStats {
    /// Queue state.
    pub queue: QueueStats,
    /// Breaker state.
    pub circuit_breaker: BreakerStats,
}

/// Receives every settled invocation, e.g. to feed metrics.
pub trait InvocationObserver: Send + Sync {
    /// Called once per call with the failure kind (`None` on success) and the
    /// total time including queue wait.
    fn on_settled(&self, binary: Binary, kind: Option<CliErrorKind>, elapsed: Duration);
}

#[derive(Debug, Default)]
struct QueueCounters {
    in_flight: usize,
    queued: usize,
    total_started: u64,
    total_completed: u64,
    total_rejected: u64,
}

/// Failure produced before or during execution.
struct Failed {
    kind: CliErrorKind,
    message: String,
    exit_code: i32,
}

impl Failed {
    fn new(kind: CliErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            exit_code: NO_EXIT_CODE,
        }
    }
}

/// Bounded, breaker-guarded runner for the `gt` and `bd` CLIs.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    executor: Arc<dyn CommandExecutor>,
    permits: Semaphore,
    counters: Mutex<QueueCounters>,
    gt_breaker: CircuitBreaker,
    bd_breaker: CircuitBreaker,
    observer: Option<Arc<dyn InvocationObserver>>,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("config", &self.config)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl ProcessSupervisor {
    /// Supervisor that spawns real processes.
    #[must_use]
    pub fn new(config: SupervisorConfig) -> Self {
        Self::with_executor(config, Arc::new(TokioExecutor))
    }

    /// Supervisor with a custom executor.
    #[must_use]
    pub fn with_executor(config: SupervisorConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        let permits = Semaphore::new(config.max_concurrent.max(1));
        let gt_breaker = CircuitBreaker::new(Binary::Gt.as_str(), config.breaker.clone());
        let bd_breaker = CircuitBreaker::new(Binary::Bd.as_str(), config.breaker.clone());
        Self {
            config,
            executor,
            permits,
            counters: Mutex::new(QueueCounters::default()),
            gt_breaker,
            bd_breaker,
            observer: None,
        }
    }

    /// Attach an observer notified of every settled call.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn InvocationObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// The breaker guarding `binary`.
    #[must_use]
    pub const fn breaker(&self, binary: Binary) -> &CircuitBreaker {
        match binary {
            Binary::Gt => &self.gt_breaker,
            Binary::Bd => &self.bd_breaker,
        }
    }

    /// Run `gt` and parse stdout as JSON.
    pub async fn gt<T: DeserializeOwned>(
        &self,
        args: impl IntoIterator<Item = impl Into<String>>,
        opts: InvokeOptions,
    ) -> CliResult<T> {
        self.run(Binary::Gt, args, opts).await
    }

    /// Run `bd` and parse stdout as JSON.
    pub async fn bd<T: DeserializeOwned>(
        &self,
        args: impl IntoIterator<Item = impl Into<String>>,
        opts: InvokeOptions,
    ) -> CliResult<T> {
        self.run(Binary::Bd, args, opts).await
    }

    /// Run `gt` and return stdout verbatim.
    pub async fn gt_text(
        &self,
        args: impl IntoIterator<Item = impl Into<String>>,
        opts: InvokeOptions,
    ) -> CliResult<String> {
        self.run_text(Binary::Gt, args, opts).await
    }

    /// Run `bd` and return stdout verbatim.
    pub async fn bd_text(
        &self,
        args: impl IntoIterator<Item = impl Into<String>>,
        opts: InvokeOptions,
    ) -> CliResult<String> {
        self.run_text(Binary::Bd, args, opts).await
    }

    /// Run `binary` and parse stdout as JSON. Empty stdout parses as `null`.
    pub async fn run<T: DeserializeOwned>(
        &self,
        binary: Binary,
        args: impl IntoIterator<Item = impl Into<String>>,
        opts: InvokeOptions,
    ) -> CliResult<T> {
        let started = Instant::now();
        let spec = self.command_spec(binary, args, &opts);
        let command = spec.display();

        let result = match self.invoke(binary, &spec, &command, &opts).await {
            Ok(output) => parse_json(&output.stdout, &command, started.elapsed()),
            Err(failed) => failure(failed, &command, started),
        };
        self.observe(binary, &result);
        result
    }

    /// Run `binary` and return stdout verbatim.
    pub async fn run_text(
        &self,
        binary: Binary,
        args: impl IntoIterator<Item = impl Into<String>>,
        opts: InvokeOptions,
    ) -> CliResult<String> {
        let started = Instant::now();
        let spec = self.command_spec(binary, args, &opts);
        let command = spec.display();

        let result = match self.invoke(binary, &spec, &command, &opts).await {
            Ok(output) => CliResult::ok(output.stdout, &command, started.elapsed()),
            Err(failed) => failure(failed, &command, started),
        };
        self.observe(binary, &result);
        result
    }

    /// Queue and breaker state.
    #[must_use]
    pub fn stats(&self) -> SupervisorStats {
        let counters = self.counters();
        SupervisorStats {
            queue: QueueStats {
                in_flight: counters.in_flight,
                queued: counters.queued,
                max_concurrent: self.config.max_concurrent,
                max_queue_depth: self.config.max_queue_depth,
                total_started: counters.total_started,
                total_completed: counters.total_completed,
                total_rejected: counters.total_rejected,
            },
            circuit_breaker: BreakerStats {
                gt: self.gt_breaker.snapshot(),
                bd: self.bd_breaker.snapshot(),
            },
        }
    }

    fn command_spec(
        &self,
        binary: Binary,
        args: impl IntoIterator<Item = impl Into<String>>,
        opts: &InvokeOptions,
    ) -> CommandSpec {
        let program = match binary {
            Binary::Gt => &self.config.gt_path,
            Binary::Bd => &self.config.bd_path,
        };
        let cwd = opts.cwd.clone().or_else(|| self.config.cwd.clone());
        let mut builder = CommandSpec::builder(program.clone()).args(args).cwd(cwd);
        for (key, value) in &self.config.env {
            builder = builder.env(key.clone(), value.clone());
        }
        builder.build()
    }

    async fn invoke(
        &self,
        binary: Binary,
        spec: &CommandSpec,
        command: &str,
        opts: &InvokeOptions,
    ) -> Result<RawOutput, Failed> {
        let cancel = opts.cancel.as_ref();
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(Failed::new(
                CliErrorKind::Cancelled,
                format!("{command} cancelled"),
            ));
        }

        let _permit = self.admit(command, cancel).await?;

        let breaker = self.breaker(binary);
        let admission = breaker.try_acquire();
        if let Admission::Rejected { retry_after } = admission {
            debug!(%command, retry_after_ms = retry_after.as_millis(), "circuit open, not spawning");
            return Err(Failed::new(
                CliErrorKind::CircuitOpen,
                format!(
                    "circuit breaker open for {binary}; retry in {}ms",
                    retry_after.as_millis()
                ),
            ));
        }

        let probe = ProbeSlot::hold(breaker, admission == Admission::Probe);
        let _running = RunningSlot::enter(self);
        let timeout = opts.timeout.unwrap_or(self.config.default_timeout);
        let exec_started = Instant::now();
        debug!(%command, timeout_ms = timeout.as_millis(), "invoking cli");

        let outcome = self.executor.execute(spec, timeout, cancel).await;
        let outcome = classify(outcome, spec, command);

        let duration_ms = exec_started.elapsed().as_millis();
        match &outcome {
            Ok(output) => {
                breaker.record_success();
                probe.settle();
                debug!(%command, duration_ms, exit_code = output.exit_code, "cli settled");
            },
            Err(failed) => {
                if failed.kind.counts_against_breaker() {
                    breaker.record_failure();
                    probe.settle();
                }
                if failed.kind == CliErrorKind::Cancelled {
                    debug!(%command, duration_ms, "cli cancelled");
                } else {
                    warn!(
                        %command,
                        duration_ms,
                        exit_code = failed.exit_code,
                        kind = %failed.kind,
                        error = %failed.message,
                        "cli invocation failed"
                    );
                }
            },
        }
        outcome
    }

    /// Wait for a concurrency slot in FIFO order.
    async fn admit(
        &self,
        command: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<SemaphorePermit<'_>, Failed> {
        match self.permits.try_acquire() {
            Ok(permit) => return Ok(permit),
            Err(TryAcquireError::Closed) => {
                return Err(Failed::new(CliErrorKind::QueueFull, "supervisor is shut down"));
            },
            Err(TryAcquireError::NoPermits) => {},
        }

        let _waiting = {
            let mut counters = self.counters();
            if counters.queued >= self.config.max_queue_depth {
                counters.total_rejected += 1;
                warn!(%command, queued = counters.queued, "invocation queue full");
                return Err(Failed::new(
                    CliErrorKind::QueueFull,
                    format!(
                        "invocation queue full ({} waiting)",
                        self.config.max_queue_depth
                    ),
                ));
            }
            counters.queued += 1;
            QueuedSlot { supervisor: self }
        };
        debug!(%command, "waiting for invocation slot");

        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            permit = self.permits.acquire() => permit.map_err(|_| {
                Failed::new(CliErrorKind::QueueFull, "supervisor is shut down")
            }),
            () = cancelled => Err(Failed::new(
                CliErrorKind::Cancelled,
                format!("{command} cancelled while queued"),
            )),
        }
    }

    fn observe<T>(&self, binary: Binary, result: &CliResult<T>) {
        if let Some(observer) = &self.observer {
            observer.on_settled(binary, result.kind(), Duration::from_millis(result.duration));
        }
    }

    fn counters(&self) -> std::sync::MutexGuard<'_, QueueCounters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Holds a place in the wait queue; leaving it (by admission, cancellation
/// or drop) decrements the count.
struct QueuedSlot<'a> {
    supervisor: &'a ProcessSupervisor,
}

impl Drop for QueuedSlot<'_> {
    fn drop(&mut self) {
        let mut counters = self.supervisor.counters();
        counters.queued = counters.queued.saturating_sub(1);
    }
}

/// Owns the breaker's half-open probe slot until the probe has been judged.
///
/// Dropping it unsettled (a non-counting failure, or the caller's future
/// being dropped mid-probe) hands the slot back so the next call can probe.
struct ProbeSlot<'a> {
    breaker: &'a CircuitBreaker,
    held: bool,
}

impl<'a> ProbeSlot<'a> {
    const fn hold(breaker: &'a CircuitBreaker, held: bool) -> Self {
        Self { breaker, held }
    }

    fn settle(mut self) {
        self.held = false;
    }
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if self.held {
            self.breaker.release_probe();
        }
    }
}

/// Marks one process as in flight for its lifetime.
struct RunningSlot<'a> {
    supervisor: &'a ProcessSupervisor,
}

impl<'a> RunningSlot<'a> {
    fn enter(supervisor: &'a ProcessSupervisor) -> Self {
        let mut counters = supervisor.counters();
        counters.in_flight += 1;
        counters.total_started += 1;
        drop(counters);
        Self { supervisor }
    }
}

impl Drop for RunningSlot<'_> {
    fn drop(&mut self) {
        let mut counters = self.supervisor.counters();
        counters.in_flight = counters.in_flight.saturating_sub(1);
        counters.total_completed += 1;
    }
}

fn classify(
    outcome: Result<RawOutput, ProcessError>,
    spec: &CommandSpec,
    command: &str,
) -> Result<RawOutput, Failed> {
    match outcome {
        Ok(output) if output.success() => Ok(output),
        Ok(output) => {
            let stderr = output.stderr.trim();
            let kind = if stderr.to_lowercase().contains("not found") {
                CliErrorKind::NotFound
            } else {
                CliErrorKind::ProcessError
            };
            let message = if !stderr.is_empty() {
                stderr.to_string()
            } else if let Some(code) = output.exit_code {
                format!("{command} exited with code {code}")
            } else {
                format!("{command} terminated by signal")
            };
            Err(Failed {
                kind,
                message,
                exit_code: output.exit_code.unwrap_or(NO_EXIT_CODE),
            })
        },
        Err(ProcessError::BinaryNotFound { .. }) => Err(Failed::new(
            CliErrorKind::SpawnFailed,
            format!("binary not found: {}", spec.program.display()),
        )),
        Err(err @ ProcessError::SpawnFailed { .. }) => {
            Err(Failed::new(CliErrorKind::SpawnFailed, err.to_string()))
        },
        Err(ProcessError::Timeout { timeout }) => Err(Failed::new(
            CliErrorKind::Timeout,
            format!("{command} timed out after {}ms", timeout.as_millis()),
        )),
        Err(ProcessError::Cancelled) => Err(Failed::new(
            CliErrorKind::Cancelled,
            format!("{command} cancelled"),
        )),
        Err(err @ ProcessError::Io(_)) => {
            Err(Failed::new(CliErrorKind::ProcessError, err.to_string()))
        },
    }
}

fn parse_json<T: DeserializeOwned>(stdout: &str, command: &str, elapsed: Duration) -> CliResult<T> {
    let payload = if stdout.trim().is_empty() {
        "null"
    } else {
        stdout
    };
    match serde_json::from_str(payload) {
        Ok(data) => CliResult::ok(data, command, elapsed),
        Err(e) => CliResult::failure(
            CliErrorKind::ParseError,
            format!("failed to parse JSON output of {command}: {e}"),
            0,
            command,
            elapsed,
        ),
    }
}

fn failure<T>(failed: Failed, command: &str, started: Instant) -> CliResult<T> {
    CliResult::failure(
        failed.kind,
        failed.message,
        failed.exit_code,
        command,
        started.elapsed(),
    )
}
