//! Workflow state types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Workflow template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowType {
    /// checkout, test, merge, deploy.
    MergeDeploy,
    /// checkout, test, merge.
    TestMerge,
    /// checkout, lint, test, build, deploy.
    FullCi,
    /// Caller-defined steps.
    Custom,
}

impl WorkflowType {
    /// Step names created for this template, in execution order.
    #[must_use]
    pub const fn template_steps(&self) -> &'static [&'static str] {
        match self {
            Self::MergeDeploy => &["checkout", "test", "merge", "deploy"],
            Self::TestMerge => &["checkout", "test", "merge"],
            Self::FullCi => &["checkout", "lint", "test", "build", "deploy"],
            Self::Custom => &[],
        }
    }

    /// Returns the wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MergeDeploy => "merge-deploy",
            Self::TestMerge => "test-merge",
            Self::FullCi => "full-ci",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workflow status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    /// No step has started.
    Pending,
    /// At least one step started and none failed.
    Running,
    /// Every step completed or was skipped.
    Completed,
    /// A step failed.
    Failed,
    /// Stopped on request.
    Cancelled,
}

impl WorkflowStatus {
    /// Returns the wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the workflow has stopped progressing.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Not started.
    Pending,
    /// Executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error. Only failed steps can be retried.
    Failed,
    /// Not executed.
    Skipped,
}

impl StepStatus {
    /// Returns the wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Completed, failed or skipped.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Completed or skipped.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    /// `step-<index>-<name>`.
    pub id: String,
    /// Step name, also the key of its configured command.
    pub name: String,
    /// Current status.
    pub status: StepStatus,
    /// Execution time in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    /// Captured output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the step last started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the step last finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowStep {
    pub(crate) fn new(index: usize, name: &str) -> Self {
        Self {
            id: format!("step-{index}-{name}"),
            name: name.to_string(),
            status: StepStatus::Pending,
            duration: None,
            output: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Back to a fresh pending step.
    pub(crate) fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.duration = None;
        self.output = None;
        self.error = None;
        self.started_at = None;
        self.completed_at = None;
    }
}

/// A multi-step pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// `wf-<base36 ms>-<random>`.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Template.
    #[serde(rename = "type")]
    pub workflow_type: WorkflowType,
    /// Current status.
    pub status: WorkflowStatus,
    /// Steps in execution order. Never reordered or extended.
    pub steps: Vec<WorkflowStep>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the workflow reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Caller-supplied parameters (branch, rig, ...).
    pub params: Map<String, Value>,
}

impl Workflow {
    pub(crate) fn new<S: AsRef<str>>(
        workflow_type: WorkflowType,
        name: String,
        step_names: &[S],
        params: Map<String, Value>,
    ) -> Self {
        Self {
            id: crate::id::generate("wf"),
            name,
            workflow_type,
            status: WorkflowStatus::Pending,
            steps: step_names
                .iter()
                .enumerate()
                .map(|(index, name)| WorkflowStep::new(index, name.as_ref()))
                .collect(),
            created_at: Utc::now(),
            completed_at: None,
            params,
        }
    }

    /// Look up a step.
    #[must_use]
    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|step| step.id == step_id)
    }

    /// First step still waiting to run.
    #[must_use]
    pub fn next_pending_step(&self) -> Option<&WorkflowStep> {
        self.steps
            .iter()
            .find(|step| step.status == StepStatus::Pending)
    }

    /// Time used for retention.
    #[must_use]
    pub fn retention_anchor(&self) -> DateTime<Utc> {
        self.completed_at.unwrap_or(self.created_at)
    }

    /// Recompute the workflow status from its steps.
    ///
    /// Terminal workflows are left alone.
    pub(crate) fn derive_status(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        let derived = if self
            .steps
            .iter()
            .any(|step| step.status == StepStatus::Failed)
        {
            WorkflowStatus::Failed
        } else if !self.steps.is_empty() && self.steps.iter().all(|step| step.status.is_done()) {
            WorkflowStatus::Completed
        } else if self.steps.iter().any(|step| step.status != StepStatus::Pending) {
            WorkflowStatus::Running
        } else {
            self.status
        };

        if derived != self.status {
            self.status = derived;
            self.completed_at = derived.is_terminal().then(Utc::now);
        }
    }
}
