//! Operation state types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of work an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationType {
    /// `git fetch` style refresh.
    Fetch,
    /// Rebase of a branch.
    Rebase,
    /// Merge of a branch.
    Merge,
    /// Test run.
    Test,
    /// Deployment.
    Deploy,
    /// Adding a rig.
    RigAdd,
    /// Anything else.
    Other,
}

impl OperationType {
    /// Returns the wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Rebase => "rebase",
            Self::Merge => "merge",
            Self::Test => "test",
            Self::Deploy => "deploy",
            Self::RigAdd => "rig-add",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of an operation.
///
/// ```text
/// Pending ──► Running ──► Completed | Failed | Cancelled
///    └──────────────────────────────────────► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    /// Created, not started.
    Pending,
    /// Running.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Stopped on request.
    Cancelled,
}

impl OperationStatus {
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

    /// Terminal statuses never change again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `cancel` may be applied.
    #[must_use]
    pub const fn is_cancellable(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracked asynchronous unit of CLI work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Unique id, `op-<base36 ms>-<random>`.
    pub id: String,

    /// Kind of work.
    #[serde(rename = "type")]
    pub operation_type: OperationType,

    /// Current status.
    pub status: OperationStatus,

    /// Creation time.
    pub started_at: DateTime<Utc>,

    /// Set exactly when the status is terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Progress percentage, 0..=100.
    pub progress: u8,

    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Append-only log lines.
    pub logs: Vec<String>,

    /// Caller-supplied context (rig name, url, ...).
    pub metadata: Map<String, Value>,
}

impl Operation {
    pub(crate) fn new(operation_type: OperationType, metadata: Map<String, Value>) -> Self {
        Self {
            id: crate::id::generate("op"),
            operation_type,
            status: OperationStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            progress: 0,
            error: None,
            logs: Vec::new(),
            metadata,
        }
    }

    /// Whether the operation has finished.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Time used for retention: completion time, or start time if unfinished.
    #[must_use]
    pub fn retention_anchor(&self) -> DateTime<Utc> {
        self.completed_at.unwrap_or(self.started_at)
    }
}
