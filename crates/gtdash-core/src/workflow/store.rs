//! In-memory workflow registry.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::WorkflowError;
use super::state::{StepStatus, Workflow, WorkflowStatus, WorkflowType};

/// Partial update for [`WorkflowStore::update_step`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepUpdate {
    /// New status.
    pub status: Option<StepStatus>,
    /// Captured output.
    pub output: Option<String>,
    /// Failure description.
    pub error: Option<String>,
    /// Execution time in milliseconds.
    pub duration: Option<u64>,
}

impl StepUpdate {
    /// Update that only sets the status.
    #[must_use]
    pub fn status(status: StepStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Filter for [`WorkflowStore::list`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct WorkflowFilter {
    /// Only workflows in this status.
    #[serde(default)]
    pub status: Option<WorkflowStatus>,
    /// Only workflows of this type.
    #[serde(default, rename = "type")]
    pub workflow_type: Option<WorkflowType>,
}

impl WorkflowFilter {
    fn matches(&self, workflow: &Workflow) -> bool {
        self.status.is_none_or(|status| workflow.status == status)
            && self
                .workflow_type
                .is_none_or(|kind| workflow.workflow_type == kind)
    }
}

struct Entry {
    workflow: Workflow,
    cancel: CancellationToken,
}

/// Registry of workflows.
#[derive(Default)]
pub struct WorkflowStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl std::fmt::Debug for WorkflowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowStore")
            .field("len", &self.len())
            .finish()
    }
}

impl WorkflowStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a workflow from its template. `Custom` yields no steps; use
    /// [`Self::create_custom`] to supply them.
    pub fn create(
        &self,
        workflow_type: WorkflowType,
        name: impl Into<String>,
        params: Map<String, Value>,
    ) -> Workflow {
        self.insert(Workflow::new(
            workflow_type,
            name.into(),
            workflow_type.template_steps(),
            params,
        ))
    }

    /// Create a custom workflow with the given steps.
    pub fn create_custom<S: AsRef<str>>(
        &self,
        name: impl Into<String>,
        step_names: &[S],
        params: Map<String, Value>,
    ) -> Workflow {
        self.insert(Workflow::new(
            WorkflowType::Custom,
            name.into(),
            step_names,
            params,
        ))
    }

    fn insert(&self, workflow: Workflow) -> Workflow {
        debug!(
            id = %workflow.id,
            kind = %workflow.workflow_type,
            steps = workflow.steps.len(),
            "workflow created"
        );
        self.lock().insert(
            workflow.id.clone(),
            Entry {
                workflow: workflow.clone(),
                cancel: CancellationToken::new(),
            },
        );
        workflow
    }

    /// Snapshot of one workflow.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Workflow> {
        self.lock().get(id).map(|entry| entry.workflow.clone())
    }

    /// Snapshots matching `filter`, newest first.
    #[must_use]
    pub fn list(&self, filter: &WorkflowFilter) -> Vec<Workflow> {
        let mut workflows: Vec<Workflow> = self
            .lock()
            .values()
            .filter(|entry| filter.matches(&entry.workflow))
            .map(|entry| entry.workflow.clone())
            .collect();
        workflows.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        workflows
    }

    /// Token that fires when the workflow is cancelled.
    #[must_use]
    pub fn cancellation_token(&self, id: &str) -> Option<CancellationToken> {
        self.lock().get(id).map(|entry| entry.cancel.clone())
    }

    /// Apply a partial update to one step and re-derive the workflow status.
    ///
    /// Entering `running` stamps `startedAt`; entering `completed`, `failed`
    /// or `skipped` stamps `completedAt`. Returns `false`, changing nothing,
    /// for an unknown workflow or step, for a status change out of `failed`
    /// (use [`Self::retry_step`]), and for a status change inside a completed
    /// or failed workflow. A terminal workflow keeps its status.
    pub fn update_step(&self, workflow_id: &str, step_id: &str, update: StepUpdate) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(workflow_id) {
            Some(entry) => apply_step_update(&mut entry.workflow, step_id, update),
            None => false,
        }
    }

    /// Atomically move a pending step to running.
    ///
    /// Returns `false` unless the workflow is active and the step was
    /// pending, so two runners never execute the same step.
    pub fn claim_step(&self, workflow_id: &str, step_id: &str) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(workflow_id) else {
            return false;
        };
        let workflow = &mut entry.workflow;
        if workflow.status.is_terminal()
            || workflow
                .step(step_id)
                .is_none_or(|step| step.status != StepStatus::Pending)
        {
            return false;
        }
        apply_step_update(workflow, step_id, StepUpdate::status(StepStatus::Running))
    }

    /// Reset a failed step to pending so it can run again.
    ///
    /// A failed workflow goes back to `running`; this is the only way out of
    /// the `failed` state.
    ///
    /// # Errors
    ///
    /// `WorkflowNotFound`, `StepNotFound`, `StepNotRetryable` unless the step
    /// failed, and `WorkflowCancelled` for a cancelled workflow.
    pub fn retry_step(&self, workflow_id: &str, step_id: &str) -> Result<(), WorkflowError> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(workflow_id)
            .ok_or_else(|| WorkflowError::WorkflowNotFound {
                id: workflow_id.to_string(),
            })?;
        let workflow = &mut entry.workflow;
        if workflow.status == WorkflowStatus::Cancelled {
            return Err(WorkflowError::WorkflowCancelled {
                id: workflow_id.to_string(),
            });
        }
        let step = workflow
            .steps
            .iter_mut()
            .find(|step| step.id == step_id)
            .ok_or_else(|| WorkflowError::StepNotFound {
                workflow_id: workflow_id.to_string(),
                step_id: step_id.to_string(),
            })?;
        if step.status != StepStatus::Failed {
            return Err(WorkflowError::StepNotRetryable {
                step_id: step_id.to_string(),
                status: step.status,
            });
        }

        step.reset();
        if workflow.status == WorkflowStatus::Failed {
            workflow.status = WorkflowStatus::Running;
            workflow.completed_at = None;
        }
        info!(id = workflow_id, step_id, "workflow step reset for retry");
        Ok(())
    }

    /// Cancel a pending or running workflow. Pending steps become skipped
    /// and the workflow's cancellation token fires.
    ///
    /// # Errors
    ///
    /// `WorkflowNotFound` or `NotCancellable`.
    pub fn cancel(&self, id: &str) -> Result<(), WorkflowError> {
        let token = {
            let mut entries = self.lock();
            let entry = entries
                .get_mut(id)
                .ok_or_else(|| WorkflowError::WorkflowNotFound { id: id.to_string() })?;
            let workflow = &mut entry.workflow;
            if workflow.status.is_terminal() {
                return Err(WorkflowError::NotCancellable {
                    id: id.to_string(),
                    status: workflow.status,
                });
            }

            let now = Utc::now();
            workflow.status = WorkflowStatus::Cancelled;
            workflow.completed_at = Some(now);
            for step in &mut workflow.steps {
                if step.status == StepStatus::Pending {
                    step.status = StepStatus::Skipped;
                    step.completed_at = Some(now);
                }
            }
            entry.cancel.clone()
        };

        info!(id, "workflow cancelled");
        token.cancel();
        Ok(())
    }

    /// Drop workflows whose completion (or creation, if unfinished) is older
    /// than `max_age`.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let max_age = TimeDelta::from_std(max_age).unwrap_or(TimeDelta::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(max_age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.cleanup_before(cutoff)
    }

    /// Drop workflows whose retention anchor is before `cutoff`.
    pub fn cleanup_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.workflow.retention_anchor() >= cutoff);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "expired workflows removed");
        }
        removed
    }

    /// Number of tracked workflows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no workflows are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn apply_step_update(workflow: &mut Workflow, step_id: &str, update: StepUpdate) -> bool {
    let settled = matches!(
        workflow.status,
        WorkflowStatus::Completed | WorkflowStatus::Failed
    );
    let Some(step) = workflow.steps.iter_mut().find(|step| step.id == step_id) else {
        return false;
    };

    let now = Utc::now();
    if let Some(status) = update.status {
        if status != step.status {
            // Only `retry_step` may move a step out of `failed`, and a
            // finished workflow's steps no longer change state.
            if step.status == StepStatus::Failed || settled {
                return false;
            }
            if status == StepStatus::Running {
                step.started_at = Some(now);
                step.completed_at = None;
            } else if status.is_finished() {
                step.completed_at = Some(now);
            }
            step.status = status;
        }
    }
    if let Some(output) = update.output {
        step.output = Some(output);
    }
    if let Some(error) = update.error {
        step.error = Some(error);
    }
    match update.duration {
        Some(duration) => step.duration = Some(duration),
        None if step.status.is_finished() && step.duration.is_none() => {
            if let (Some(started), Some(completed)) = (step.started_at, step.completed_at) {
                step.duration = u64::try_from((completed - started).num_milliseconds()).ok();
            }
        },
        None => {},
    }

    let before = workflow.status;
    workflow.derive_status();
    if workflow.status != before {
        info!(
            id = %workflow.id,
            from = %before,
            to = %workflow.status,
            "workflow status changed"
        );
    }
    true
}
