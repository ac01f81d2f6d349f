//! Typed result envelope returned by every supervised CLI invocation.
//!
//! Callers branch on [`CliResult::success`] (or [`CliResult::kind`]) and never
//! have to inspect error text to decide what went wrong.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exit code reported when the process produced no exit status of its own
/// (spawn failure, kill on timeout, signal, short-circuit).
pub const NO_EXIT_CODE: i32 = -1;

/// Structured failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CliErrorKind {
    /// The CLI ran and reported that the requested entity does not exist.
    NotFound,
    /// The binary could not be started.
    SpawnFailed,
    /// The process exceeded its deadline and was killed.
    Timeout,
    /// The process exited with a non-zero code.
    ProcessError,
    /// The circuit breaker for the binary is open.
    CircuitOpen,
    /// Stdout was not the expected JSON.
    ParseError,
    /// The invocation queue is full.
    QueueFull,
    /// The invocation was cancelled by its caller.
    Cancelled,
}

impl CliErrorKind {
    /// Returns the kind as a static snake-case string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::SpawnFailed => "spawn_failed",
            Self::Timeout => "timeout",
            Self::ProcessError => "process_error",
            Self::CircuitOpen => "circuit_open",
            Self::ParseError => "parse_error",
            Self::QueueFull => "queue_full",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether this failure says something about the health of the binary.
    ///
    /// Only these kinds advance the circuit breaker.
    #[must_use]
    pub const fn counts_against_breaker(&self) -> bool {
        matches!(
            self,
            Self::SpawnFailed | Self::Timeout | Self::ProcessError | Self::NotFound
        )
    }
}

impl fmt::Display for CliErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure half of a [`CliResult`], for callers that prefer `Result`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliFailure {
    /// Failure classification.
    pub kind: CliErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Exit code, or [`NO_EXIT_CODE`].
    pub exit_code: i32,
    /// Command line that was run.
    pub command: String,
}

impl fmt::Display for CliFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.command, self.kind, self.message)
    }
}

impl std::error::Error for CliFailure {}

/// Result of one supervised CLI invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CliResult<T> {
    /// True iff the process exited 0 and its output parsed as expected.
    pub success: bool,
    /// Parsed payload, present only on success.
    pub data: Option<T>,
    /// Failure description, present only on failure.
    pub error: Option<String>,
    /// Failure classification, present only on failure.
    pub error_kind: Option<CliErrorKind>,
    /// Process exit code, or [`NO_EXIT_CODE`].
    pub exit_code: i32,
    /// Wall-clock duration in milliseconds, including queue wait.
    pub duration: u64,
    /// Display form of the command line.
    pub command: String,
}

impl<T> CliResult<T> {
    /// Creates a successful result.
    #[must_use]
    pub fn ok(data: T, command: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_kind: None,
            exit_code: 0,
            duration: duration_millis(duration),
            command: command.into(),
        }
    }

    /// Creates a failed result.
    #[must_use]
    pub fn failure(
        kind: CliErrorKind,
        message: impl Into<String>,
        exit_code: i32,
        command: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            error_kind: Some(kind),
            exit_code,
            duration: duration_millis(duration),
            command: command.into(),
        }
    }

    /// Returns the failure kind, or `None` on success.
    #[must_use]
    pub const fn kind(&self) -> Option<CliErrorKind> {
        self.error_kind
    }

    /// Maps the payload, preserving the envelope.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CliResult<U> {
        CliResult {
            success: self.success,
            data: self.data.map(f),
            error: self.error,
            error_kind: self.error_kind,
            exit_code: self.exit_code,
            duration: self.duration,
            command: self.command,
        }
    }

    /// Converts into a plain `Result`.
    ///
    /// # Errors
    ///
    /// Returns the [`CliFailure`] when the invocation did not succeed.
    pub fn into_result(self) -> Result<T, CliFailure> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            _ => Err(CliFailure {
                kind: self.error_kind.unwrap_or(CliErrorKind::ProcessError),
                message: self.error.unwrap_or_default(),
                exit_code: self.exit_code,
                command: self.command,
            }),
        }
    }
}

#[allow(clippy::cast_possible_truncation)] // u64 millis covers ~584M years
fn duration_millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}
