//! Circuit breaker for external CLI binaries.
//!
//! Stops issuing invocations to a binary that keeps failing (missing binary,
//! broken workspace) so a burst of dashboard requests doesn't hammer a dead
//! dependency.
//!
//! # State Machine
//!
//! ```text
//!            N consecutive failures
//!   Closed ─────────────────────────► Open
//!     ▲                                 │ cooldown elapsed
//!     │ probe succeeds                  ▼
//!     └──────────────────────────── HalfOpen ──probe fails──► Open
//! ```
//!
//! While half-open exactly one probe invocation is admitted; everything else
//! is rejected until the probe settles.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::humantime_serde;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Whether the breaker is active. When disabled every call is admitted.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long the circuit stays open before admitting a probe.
    #[serde(default = "default_cooldown")]
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
}

const fn default_enabled() -> bool {
    true
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_cooldown() -> Duration {
    Duration::from_secs(30)
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            failure_threshold: default_failure_threshold(),
            cooldown: default_cooldown(),
        }
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Tripped; calls are short-circuited.
    Open,
    /// Cooldown elapsed; one probe is allowed through.
    HalfOpen,
}

/// Outcome of asking the breaker for permission to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Run normally.
    Allowed,
    /// Run as the single half-open probe. The caller must settle it with
    /// `record_success`, `record_failure` or `release_probe`.
    Probe,
    /// Do not run.
    Rejected {
        /// Time left until a probe will be admitted.
        retry_after: Duration,
    },
}

impl Admission {
    /// True unless rejected.
    #[must_use]
    pub const fn is_admitted(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}

/// Point-in-time view of a breaker, for stats endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Configured threshold.
    pub failure_threshold: u32,
    /// Configured cooldown in milliseconds.
    pub cooldown_ms: u64,
    /// When the circuit last opened.
    pub opened_at: Option<DateTime<Utc>>,
    /// How many times the circuit has opened.
    pub total_trips: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    probe_in_flight: bool,
    total_trips: u64,
}

/// Consecutive-failure circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                opened_at_wall: None,
                probe_in_flight: false,
                total_trips: 0,
            }),
        }
    }

    /// Ask for permission to run an invocation now.
    pub fn try_acquire(&self) -> Admission {
        self.try_acquire_at(Instant::now())
    }

    /// Ask for permission to run an invocation at `now`.
    pub fn try_acquire_at(&self, now: Instant) -> Admission {
        if !self.config.enabled {
            return Admission::Allowed;
        }

        let mut inner = self.lock();
        let state = inner.state;
        match state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.config.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!(breaker = %self.name, "circuit half-open, admitting probe");
                    Admission::Probe
                } else {
                    Admission::Rejected {
                        retry_after: self.config.cooldown - elapsed,
                    }
                }
            },
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Admission::Rejected {
                        retry_after: Duration::ZERO,
                    }
                } else {
                    inner.probe_in_flight = true;
                    Admission::Probe
                }
            },
        }
    }

    /// Record a successful invocation.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        if inner.state != CircuitState::Closed {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            info!(breaker = %self.name, "circuit closed after successful probe");
        }
    }

    /// Record a failed invocation.
    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    /// Record a failed invocation observed at `now`.
    pub fn record_failure_at(&self, now: Instant) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        let state = inner.state;
        match state {
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                self.trip(&mut inner, now);
            },
            CircuitState::Closed => {
                if self.config.enabled
                    && inner.consecutive_failures >= self.config.failure_threshold
                {
                    self.trip(&mut inner, now);
                }
            },
            // Late failures from calls admitted before the trip.
            CircuitState::Open => {},
        }
    }

    /// Release the half-open probe slot without judging the binary, e.g.
    /// when the probe was cancelled or failed only to parse.
    pub fn release_probe(&self) {
        let mut inner = self.lock();
        inner.probe_in_flight = false;
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Snapshot for stats.
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            cooldown_ms: u64::try_from(self.config.cooldown.as_millis()).unwrap_or(u64::MAX),
            opened_at: inner.opened_at_wall,
            total_trips: inner.total_trips,
        }
    }

    /// Force the breaker back to closed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.opened_at_wall = None;
        inner.probe_in_flight = false;
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn trip(&self, inner: &mut BreakerInner, now: Instant) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.opened_at_wall = Some(Utc::now());
        inner.total_trips += 1;
        warn!(
            breaker = %self.name,
            consecutive_failures = inner.consecutive_failures,
            cooldown_ms = self.config.cooldown.as_millis(),
            "circuit opened"
        );
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
