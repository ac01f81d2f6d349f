//! Prometheus metrics for the dashboard daemon.
//!
//! # Metrics Families
//!
//! | Metric | Type | Description | Labels |
//! |--------|------|-------------|--------|
//! | `gtdash_cli_invocations_total` | Counter | Settled CLI calls | `binary`, `outcome` |
//! | `gtdash_cli_invocation_duration_seconds` | Histogram | Call time including queue wait | `binary` |
//! | `gtdash_supervisor_queue` | Gauge | Running and waiting calls | `state` |
//! | `gtdash_circuit_breaker_state` | Gauge | 0 closed, 1 half-open, 2 open | `binary` |
//! | `gtdash_operations_started_total` | Counter | Operations started | `type` |
//! | `gtdash_workflows_started_total` | Counter | Workflow runs started | `type` |
//!
//! `outcome` is `success` or the [`CliErrorKind`] wire name. Gauges are
//! refreshed from [`SupervisorStats`] on every scrape.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use gtdash_core::breaker::CircuitState;
use gtdash_core::operation::OperationType;
use gtdash_core::process::Binary;
use gtdash_core::result::CliErrorKind;
use gtdash_core::supervisor::{InvocationObserver, SupervisorStats};
use gtdash_core::workflow::WorkflowType;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use thiserror::Error;

/// Histogram buckets for CLI call duration (in seconds).
pub const CLI_DURATION_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Result type for metrics operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

/// Dashboard metrics.
///
/// All metrics use interior mutability; the struct is cheap to clone and
/// safe to share across threads.
#[derive(Clone)]
pub struct DashboardMetrics {
    cli_invocations_total: CounterVec,
    cli_invocation_duration: HistogramVec,
    supervisor_queue: GaugeVec,
    circuit_breaker_state: GaugeVec,
    operations_started_total: CounterVec,
    workflows_started_total: CounterVec,
}

impl DashboardMetrics {
    /// Creates the metrics and registers them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register (e.g., duplicate name).
    pub fn new(registry: &Registry) -> MetricsResult<Self> {
        let cli_invocations_total = CounterVec::new(
            Opts::new("gtdash_cli_invocations_total", "Settled CLI invocations"),
            &["binary", "outcome"],
        )?;
        registry.register(Box::new(cli_invocations_total.clone()))?;

        let cli_invocation_duration = HistogramVec::new(
            HistogramOpts::new(
                "gtdash_cli_invocation_duration_seconds",
                "CLI invocation time including queue wait",
            )
            .buckets(CLI_DURATION_BUCKETS.to_vec()),
            &["binary"],
        )?;
        registry.register(Box::new(cli_invocation_duration.clone()))?;

        let supervisor_queue = GaugeVec::new(
            Opts::new("gtdash_supervisor_queue", "Running and waiting CLI calls"),
            &["state"],
        )?;
        registry.register(Box::new(supervisor_queue.clone()))?;

        let circuit_breaker_state = GaugeVec::new(
            Opts::new(
                "gtdash_circuit_breaker_state",
                "Circuit breaker state (0 closed, 1 half-open, 2 open)",
            ),
            &["binary"],
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        let operations_started_total = CounterVec::new(
            Opts::new("gtdash_operations_started_total", "Operations started"),
            &["type"],
        )?;
        registry.register(Box::new(operations_started_total.clone()))?;

        let workflows_started_total = CounterVec::new(
            Opts::new("gtdash_workflows_started_total", "Workflow runs started"),
            &["type"],
        )?;
        registry.register(Box::new(workflows_started_total.clone()))?;

        Ok(Self {
            cli_invocations_total,
            cli_invocation_duration,
            supervisor_queue,
            circuit_breaker_state,
            operations_started_total,
            workflows_started_total,
        })
    }

    /// Records one settled CLI call.
    pub fn cli_invocation_settled(
        &self,
        binary: Binary,
        kind: Option<CliErrorKind>,
        elapsed: Duration,
    ) {
        let outcome = kind.map_or("success", |kind| kind.as_str());
        self.cli_invocations_total
            .with_label_values(&[binary.as_str(), outcome])
            .inc();
        self.cli_invocation_duration
            .with_label_values(&[binary.as_str()])
            .observe(elapsed.as_secs_f64());
    }

    /// Records a started operation.
    pub fn operation_started(&self, operation_type: OperationType) {
        self.operations_started_total
            .with_label_values(&[operation_type.as_str()])
            .inc();
    }

    /// Records a started (or resumed) workflow run.
    pub fn workflow_started(&self, workflow_type: WorkflowType) {
        self.workflows_started_total
            .with_label_values(&[workflow_type.as_str()])
            .inc();
    }

    /// Refreshes the queue and breaker gauges.
    #[allow(clippy::cast_precision_loss)] // queue sizes are small
    pub fn observe_supervisor(&self, stats: &SupervisorStats) {
        self.supervisor_queue
            .with_label_values(&["in_flight"])
            .set(stats.queue.in_flight as f64);
        self.supervisor_queue
            .with_label_values(&["queued"])
            .set(stats.queue.queued as f64);

        for (binary, snapshot) in [
            (Binary::Gt, &stats.circuit_breaker.gt),
            (Binary::Bd, &stats.circuit_breaker.bd),
        ] {
            let value = match snapshot.state {
                CircuitState::Closed => 0.0,
                CircuitState::HalfOpen => 1.0,
                CircuitState::Open => 2.0,
            };
            self.circuit_breaker_state
                .with_label_values(&[binary.as_str()])
                .set(value);
        }
    }
}

impl InvocationObserver for DashboardMetrics {
    fn on_settled(&self, binary: Binary, kind: Option<CliErrorKind>, elapsed: Duration) {
        self.cli_invocation_settled(binary, kind, elapsed);
    }
}

/// Registry owning the dashboard metrics.
pub struct MetricsRegistry {
    registry: Registry,
    metrics: DashboardMetrics,
}

impl fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsRegistry").finish_non_exhaustive()
    }
}

impl MetricsRegistry {
    /// Creates a registry with all dashboard metrics registered.
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails.
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();
        let metrics = DashboardMetrics::new(&registry)?;
        Ok(Self { registry, metrics })
    }

    /// Returns the dashboard metrics.
    #[must_use]
    pub const fn metrics(&self) -> &DashboardMetrics {
        &self.metrics
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

/// Shared metrics registry.
pub type SharedMetricsRegistry = Arc<MetricsRegistry>;

/// Creates a new shared metrics registry.
///
/// # Errors
///
/// Returns an error if metric registration fails.
pub fn new_shared_registry() -> MetricsResult<SharedMetricsRegistry> {
    Ok(Arc::new(MetricsRegistry::new()?))
}
