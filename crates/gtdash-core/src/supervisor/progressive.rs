//! Retry-on-timeout with a growing deadline.
//!
//! Slow CLI commands (a first `gt rig add` cloning a large repository, say)
//! sometimes need more time than the default deadline. This layer sits above
//! the supervisor and re-issues a call only when it timed out, giving each
//! attempt a longer deadline. Any other outcome is returned as-is.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{InvokeOptions, ProcessSupervisor};
use crate::config::humantime_serde;
use crate::process::Binary;
use crate::result::{CliErrorKind, CliResult};

/// How the deadline grows between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Same deadline every attempt.
    Fixed {
        /// Deadline per attempt.
        #[serde(with = "humantime_serde")]
        timeout: Duration,

        /// Total attempts, including the first.
        #[serde(default = "default_max_attempts")]
        max_attempts: u32,
    },

    /// Deadline grows by a constant increment.
    Linear {
        /// First deadline.
        #[serde(with = "humantime_serde")]
        initial: Duration,

        /// Added per attempt.
        #[serde(with = "humantime_serde")]
        increment: Duration,

        /// Upper bound.
        #[serde(with = "humantime_serde")]
        max_timeout: Duration,

        /// Total attempts, including the first.
        #[serde(default = "default_max_attempts")]
        max_attempts: u32,
    },

    /// Deadline grows geometrically.
    Exponential {
        /// First deadline.
        #[serde(with = "humantime_serde")]
        initial: Duration,

        /// Upper bound.
        #[serde(with = "humantime_serde")]
        max_timeout: Duration,

        /// Growth factor per attempt (default: 2.0).
        #[serde(default = "default_multiplier")]
        multiplier: f64,

        /// Total attempts, including the first.
        #[serde(default = "default_max_attempts")]
        max_attempts: u32,
    },
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::Exponential {
            initial: Duration::from_secs(30),
            max_timeout: Duration::from_secs(300),
            multiplier: 2.0,
            max_attempts: default_max_attempts(),
        }
    }
}

impl TimeoutPolicy {
    /// Deadline for a given attempt number (1-based).
    #[must_use]
    pub fn timeout_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            Self::Fixed { timeout, .. } => *timeout,
            Self::Linear {
                initial,
                increment,
                max_timeout,
                ..
            } => {
                let timeout = initial.saturating_add(increment.saturating_mul(attempt - 1));
                timeout.min(*max_timeout)
            },
            Self::Exponential {
                initial,
                max_timeout,
                multiplier,
                ..
            } => {
                #[allow(clippy::cast_possible_wrap)] // attempt count won't exceed i32
                let secs = initial.as_secs_f64() * multiplier.powi((attempt - 1) as i32);
                Duration::try_from_secs_f64(secs)
                    .unwrap_or(*max_timeout)
                    .min(*max_timeout)
            },
        }
    }

    /// Total attempts allowed (at least one).
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        let attempts = match self {
            Self::Fixed { max_attempts, .. }
            | Self::Linear { max_attempts, .. }
            | Self::Exponential { max_attempts, .. } => *max_attempts,
        };
        attempts.max(1)
    }
}

/// Run `binary` expecting JSON, retrying only on timeout.
///
/// Each attempt overrides `opts.timeout` with the policy's deadline. The
/// result of the last attempt is returned.
pub async fn run_with_progressive_timeout<T: DeserializeOwned>(
    supervisor: &ProcessSupervisor,
    binary: Binary,
    args: &[String],
    opts: InvokeOptions,
    policy: &TimeoutPolicy,
) -> CliResult<T> {
    let mut attempt = 1;
    loop {
        let attempt_opts = InvokeOptions {
            timeout: Some(policy.timeout_for_attempt(attempt)),
            ..opts.clone()
        };
        let result = supervisor.run(binary, args.iter().cloned(), attempt_opts).await;
        if !should_retry(&result, attempt, policy) {
            return result;
        }
        attempt += 1;
    }
}

/// Text-mode counterpart of [`run_with_progressive_timeout`].
pub async fn run_text_with_progressive_timeout(
    supervisor: &ProcessSupervisor,
    binary: Binary,
    args: &[String],
    opts: InvokeOptions,
    policy: &TimeoutPolicy,
) -> CliResult<String> {
    let mut attempt = 1;
    loop {
        let attempt_opts = InvokeOptions {
            timeout: Some(policy.timeout_for_attempt(attempt)),
            ..opts.clone()
        };
        let result = supervisor
            .run_text(binary, args.iter().cloned(), attempt_opts)
            .await;
        if !should_retry(&result, attempt, policy) {
            return result;
        }
        attempt += 1;
    }
}

fn should_retry<T>(result: &CliResult<T>, attempt: u32, policy: &TimeoutPolicy) -> bool {
    if result.kind() != Some(CliErrorKind::Timeout) || attempt >= policy.max_attempts() {
        return false;
    }
    info!(
        command = %result.command,
        attempt,
        next_timeout_ms = policy.timeout_for_attempt(attempt + 1).as_millis(),
        "cli timed out, retrying with a longer deadline"
    );
    true
}
