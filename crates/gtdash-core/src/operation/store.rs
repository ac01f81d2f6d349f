//! In-memory operation registry.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::error::OperationError;
use super::state::{Operation, OperationStatus, OperationType};

/// Default retention for [`OperationStore::cleanup`].
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Hook that stops the work behind an operation.
pub type CancelCallback = Box<dyn FnOnce() + Send + 'static>;

/// Partial update for [`OperationStore::update`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationUpdate {
    /// New status.
    pub status: Option<OperationStatus>,
    /// New progress; values above 100 are clamped.
    pub progress: Option<u8>,
    /// New error text.
    pub error: Option<String>,
}

impl OperationUpdate {
    /// Update that only sets the status.
    #[must_use]
    pub fn status(status: OperationStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Filter for [`OperationStore::list`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct OperationFilter {
    /// Only operations in this status.
    #[serde(default)]
    pub status: Option<OperationStatus>,
    /// Only operations of this type.
    #[serde(default, rename = "type")]
    pub operation_type: Option<OperationType>,
}

impl OperationFilter {
    fn matches(&self, operation: &Operation) -> bool {
        self.status.is_none_or(|status| operation.status == status)
            && self
                .operation_type
                .is_none_or(|kind| operation.operation_type == kind)
    }
}

struct Entry {
    operation: Operation,
    on_cancel: Option<CancelCallback>,
}

/// Registry of asynchronous operations.
///
/// Every method takes the internal lock once, so each call is atomic with
/// respect to the others. Cancel callbacks run after the lock is released.
#[derive(Default)]
pub struct OperationStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl std::fmt::Debug for OperationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationStore")
            .field("len", &self.len())
            .finish()
    }
}

impl OperationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending operation.
    pub fn create(&self, operation_type: OperationType, metadata: Map<String, Value>) -> Operation {
        let operation = Operation::new(operation_type, metadata);
        debug!(id = %operation.id, kind = %operation_type, "operation created");
        self.lock().insert(
            operation.id.clone(),
            Entry {
                operation: operation.clone(),
                on_cancel: None,
            },
        );
        operation
    }

    /// Snapshot of one operation.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Operation> {
        self.lock().get(id).map(|entry| entry.operation.clone())
    }

    /// Snapshots matching `filter`, newest first.
    #[must_use]
    pub fn list(&self, filter: &OperationFilter) -> Vec<Operation> {
        let mut operations: Vec<Operation> = self
            .lock()
            .values()
            .filter(|entry| filter.matches(&entry.operation))
            .map(|entry| entry.operation.clone())
            .collect();
        operations.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        operations
    }

    /// Apply a partial update.
    ///
    /// Returns `false` and changes nothing when the id is unknown or the
    /// update would move a terminal operation to another status or a
    /// running one back to `pending`.
    pub fn update(&self, id: &str, update: OperationUpdate) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(id) else {
            return false;
        };
        let operation = &mut entry.operation;

        if let Some(status) = update.status {
            if operation.status.is_terminal() && status != operation.status {
                debug!(id, from = %operation.status, to = %status, "ignoring update of finished operation");
                return false;
            }
            if operation.status == OperationStatus::Running && status == OperationStatus::Pending {
                debug!(id, "ignoring move of running operation back to pending");
                return false;
            }
        }

        if let Some(status) = update.status {
            if status != operation.status {
                operation.status = status;
                if status.is_terminal() {
                    operation.completed_at = Some(Utc::now());
                    entry.on_cancel = None;
                }
            }
        }
        if let Some(progress) = update.progress {
            operation.progress = progress.min(100);
        }
        if let Some(error) = update.error {
            operation.error = Some(error);
        }
        true
    }

    /// Append one log line.
    pub fn append_log(&self, id: &str, line: impl Into<String>) -> bool {
        match self.lock().get_mut(id) {
            Some(entry) => {
                entry.operation.logs.push(line.into());
                true
            },
            None => false,
        }
    }

    /// Register the hook that stops this operation, replacing any previous
    /// one.
    pub fn set_cancel_callback(
        &self,
        id: &str,
        callback: impl FnOnce() + Send + 'static,
    ) -> bool {
        match self.lock().get_mut(id) {
            Some(entry) => {
                entry.on_cancel = Some(Box::new(callback));
                true
            },
            None => false,
        }
    }

    /// Cancel a pending or running operation.
    ///
    /// The status becomes `cancelled` before the callback runs, and the
    /// callback runs at most once.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id, `NotCancellable` once finished, and
    /// `NoCancelHandler` when no callback was registered.
    pub fn cancel(&self, id: &str) -> Result<(), OperationError> {
        let callback = {
            let mut entries = self.lock();
            let entry = entries.get_mut(id).ok_or_else(|| OperationError::NotFound {
                id: id.to_string(),
            })?;
            let status = entry.operation.status;
            if !status.is_cancellable() {
                return Err(OperationError::NotCancellable {
                    id: id.to_string(),
                    status,
                });
            }
            let callback = entry
                .on_cancel
                .take()
                .ok_or_else(|| OperationError::NoCancelHandler { id: id.to_string() })?;
            entry.operation.status = OperationStatus::Cancelled;
            entry.operation.completed_at = Some(Utc::now());
            callback
        };

        info!(id, "operation cancelled");
        callback();
        Ok(())
    }

    /// Drop operations whose completion (or start, if unfinished) is older
    /// than `max_age`. Returns how many were removed.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let max_age = TimeDelta::from_std(max_age).unwrap_or(TimeDelta::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(max_age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.cleanup_before(cutoff)
    }

    /// Drop operations whose retention anchor is before `cutoff`.
    pub fn cleanup_before(&self, cutoff: DateTime<Utc>) -> usize {
        let removed = {
            let mut entries = self.lock();
            let before = entries.len();
            entries.retain(|_, entry| entry.operation.retention_anchor() >= cutoff);
            before - entries.len()
        };
        if removed > 0 {
            debug!(removed, "expired operations removed");
        }
        removed
    }

    /// Number of tracked operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no operations are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
