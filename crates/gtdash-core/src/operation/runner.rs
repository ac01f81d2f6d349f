//! Background execution of a supervised CLI command as an operation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::state::{Operation, OperationStatus, OperationType};
use super::store::{OperationStore, OperationUpdate};
use crate::process::Binary;
use crate::result::CliErrorKind;
use crate::supervisor::{InvokeOptions, ProcessSupervisor};

/// What to run and how to record it.
#[derive(Debug, Clone)]
pub struct OperationLaunch {
    /// Operation type to record.
    pub operation_type: OperationType,
    /// Operation metadata.
    pub metadata: Map<String, Value>,
    /// Binary to invoke.
    pub binary: Binary,
    /// Arguments, passed verbatim.
    pub args: Vec<String>,
    /// Deadline override.
    pub timeout: Option<Duration>,
    /// Working directory override.
    pub cwd: Option<PathBuf>,
}

/// Start `launch` in the background and return the running operation.
///
/// Cancelling the operation through the store kills the subprocess. Each
/// stdout line of a successful run is appended to the operation log.
///
/// Must be called from within a tokio runtime.
pub fn spawn_cli_operation(
    store: &Arc<OperationStore>,
    supervisor: &Arc<ProcessSupervisor>,
    launch: OperationLaunch,
) -> Operation {
    let OperationLaunch {
        operation_type,
        metadata,
        binary,
        args,
        timeout,
        cwd,
    } = launch;

    let operation = store.create(operation_type, metadata);
    let id = operation.id.clone();

    let token = CancellationToken::new();
    let trigger = token.clone();
    store.set_cancel_callback(&id, move || trigger.cancel());

    store.append_log(&id, format!("Running: {binary} {}", args.join(" ")));
    store.update(&id, OperationUpdate::status(OperationStatus::Running));
    info!(%id, kind = %operation_type, %binary, "operation started");

    let opts = InvokeOptions {
        timeout,
        cwd,
        cancel: Some(token),
    };
    let task_store = Arc::clone(store);
    let task_supervisor = Arc::clone(supervisor);
    let task_id = id.clone();
    tokio::spawn(async move {
        let result = task_supervisor.run_text(binary, args, opts).await;
        let store = task_store;
        let id = task_id;

        if result.success {
            for line in result.data.as_deref().unwrap_or_default().lines() {
                if !line.trim().is_empty() {
                    store.append_log(&id, line);
                }
            }
            store.append_log(&id, format!("Completed in {}ms", result.duration));
            store.update(
                &id,
                OperationUpdate {
                    status: Some(OperationStatus::Completed),
                    progress: Some(100),
                    error: None,
                },
            );
            info!(%id, duration_ms = result.duration, "operation completed");
        } else if result.kind() == Some(CliErrorKind::Cancelled) {
            store.append_log(&id, "Cancelled");
            info!(%id, "operation stopped after cancel");
        } else {
            let error = result.error.unwrap_or_default();
            store.append_log(&id, format!("Failed: {error}"));
            store.update(
                &id,
                OperationUpdate {
                    status: Some(OperationStatus::Failed),
                    progress: None,
                    error: Some(error.clone()),
                },
            );
            warn!(%id, kind = ?result.error_kind, %error, "operation failed");
        }
    });

    store.get(&id).unwrap_or(operation)
}
