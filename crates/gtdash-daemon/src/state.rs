//! Shared daemon state.
//!
//! One [`AppState`] is built at startup and cloned into every request
//! handler. All members are reference counted; cloning is cheap.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gtdash_core::config::{DashboardConfig, RetentionConfig};
use gtdash_core::operation::OperationStore;
use gtdash_core::supervisor::{
    CommandExecutor, InvocationObserver, ProcessSupervisor, TokioExecutor,
};
use gtdash_core::workflow::{WorkflowRunner, WorkflowStore};
use tracing::info;

use crate::metrics::{MetricsResult, SharedMetricsRegistry, new_shared_registry};

/// Deadline for `gt rig add`, which clones a repository.
pub const RIG_ADD_TIMEOUT: Duration = Duration::from_secs(120);

/// Services shared by all handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Supervised CLI access.
    pub supervisor: Arc<ProcessSupervisor>,
    /// Tracked operations.
    pub operations: Arc<OperationStore>,
    /// Tracked workflows.
    pub workflows: Arc<WorkflowStore>,
    /// Executes workflow steps.
    pub runner: WorkflowRunner,
    /// Prometheus metrics.
    pub metrics: SharedMetricsRegistry,
    retention: RetentionConfig,
    started_at: DateTime<Utc>,
}

impl AppState {
    /// Build the state for `config`, spawning real processes.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics cannot be registered.
    pub fn new(config: &DashboardConfig) -> MetricsResult<Self> {
        Self::with_executor(config, Arc::new(TokioExecutor))
    }

    /// Build the state with a custom executor.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics cannot be registered.
    pub fn with_executor(
        config: &DashboardConfig,
        executor: Arc<dyn CommandExecutor>,
    ) -> MetricsResult<Self> {
        let metrics = new_shared_registry()?;
        let observer: Arc<dyn InvocationObserver> = Arc::new(metrics.metrics().clone());
        let supervisor = Arc::new(
            ProcessSupervisor::with_executor(config.supervisor.clone(), executor)
                .with_observer(observer),
        );
        let operations = Arc::new(OperationStore::new());
        let workflows = Arc::new(WorkflowStore::new());
        let runner = WorkflowRunner::new(
            Arc::clone(&workflows),
            Arc::clone(&supervisor),
            config.workflows.clone(),
        );

        Ok(Self {
            supervisor,
            operations,
            workflows,
            runner,
            metrics,
            retention: config.retention.clone(),
            started_at: Utc::now(),
        })
    }

    /// When the daemon started.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Seconds since the daemon started.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        let elapsed = Utc::now().signed_duration_since(self.started_at);
        u64::try_from(elapsed.num_seconds()).unwrap_or(0)
    }

    /// Retention settings.
    #[must_use]
    pub const fn retention(&self) -> &RetentionConfig {
        &self.retention
    }

    /// Drop expired operations and workflows. Returns how many of each were
    /// removed.
    pub fn sweep(&self) -> (usize, usize) {
        let operations = self.operations.cleanup(self.retention.operation_max_age);
        let workflows = self.workflows.cleanup(self.retention.workflow_max_age);
        if operations > 0 || workflows > 0 {
            info!(operations, workflows, "retention sweep removed expired entries");
        }
        (operations, workflows)
    }

    /// Sweep every `sweep_interval` until the task is aborted.
    pub async fn run_retention_sweeper(self) {
        let mut interval = tokio::time::interval(self.retention.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            self.sweep();
        }
    }
}
