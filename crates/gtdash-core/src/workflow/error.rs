//! Workflow store error types.

use thiserror::Error;

use super::state::{StepStatus, WorkflowStatus};

/// Errors returned by workflow store commands.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum WorkflowError {
    /// No workflow with this id.
    #[error("workflow not found: {id}")]
    WorkflowNotFound {
        /// The requested id.
        id: String,
    },

    /// The workflow has no such step.
    #[error("step {step_id} not found in workflow {workflow_id}")]
    StepNotFound {
        /// The workflow id.
        workflow_id: String,
        /// The requested step id.
        step_id: String,
    },

    /// Only failed steps can be retried.
    #[error("step {step_id} cannot be retried in status {status}")]
    StepNotRetryable {
        /// The step id.
        step_id: String,
        /// Its current status.
        status: StepStatus,
    },

    /// The workflow was cancelled; its steps are frozen.
    #[error("workflow {id} was cancelled")]
    WorkflowCancelled {
        /// The workflow id.
        id: String,
    },

    /// Only pending or running workflows can be cancelled.
    #[error("workflow {id} cannot be cancelled in status {status}")]
    NotCancellable {
        /// The workflow id.
        id: String,
        /// Its current status.
        status: WorkflowStatus,
    },
}
