//! Executes workflow steps through the supervisor.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::state::{StepStatus, WorkflowStatus};
use super::store::{StepUpdate, WorkflowStore};
use crate::config::WorkflowsConfig;
use crate::result::CliErrorKind;
use crate::supervisor::{InvokeOptions, ProcessSupervisor};

/// Drives workflows step by step.
///
/// Each step name is looked up in the configured command table and run as
/// `gt <args...>`. `{key}` placeholders in the arguments are replaced by the
/// workflow's string params; the result is still one argv element per
/// argument. Steps with no configured command are skipped. Execution stops
/// at the first failed step and when the workflow is cancelled.
#[derive(Debug, Clone)]
pub struct WorkflowRunner {
    store: Arc<WorkflowStore>,
    supervisor: Arc<ProcessSupervisor>,
    commands: WorkflowsConfig,
    step_timeout: Option<Duration>,
}

impl WorkflowRunner {
    /// Create a runner.
    #[must_use]
    pub const fn new(
        store: Arc<WorkflowStore>,
        supervisor: Arc<ProcessSupervisor>,
        commands: WorkflowsConfig,
    ) -> Self {
        Self {
            store,
            supervisor,
            commands,
            step_timeout: None,
        }
    }

    /// Override the supervisor's default deadline for every step.
    #[must_use]
    pub const fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    /// Run `workflow_id` in a background task.
    pub fn spawn(&self, workflow_id: String) -> JoinHandle<Option<WorkflowStatus>> {
        let runner = self.clone();
        tokio::spawn(async move { runner.run(&workflow_id).await })
    }

    /// Run every pending step in order.
    ///
    /// Returns the workflow status when the runner stops, or `None` if the
    /// workflow does not exist (or was removed while running).
    pub async fn run(&self, workflow_id: &str) -> Option<WorkflowStatus> {
        let cancel = self.store.cancellation_token(workflow_id)?;
        info!(id = workflow_id, "workflow run started");

        loop {
            let workflow = self.store.get(workflow_id)?;
            if workflow.status.is_terminal() {
                info!(id = workflow_id, status = %workflow.status, "workflow run finished");
                return Some(workflow.status);
            }
            let Some(step) = workflow.next_pending_step() else {
                return Some(workflow.status);
            };
            let step_id = step.id.clone();
            let step_name = step.name.clone();

            let Some(args) = self.commands.command_for(&step_name) else {
                self.store.update_step(
                    workflow_id,
                    &step_id,
                    StepUpdate {
                        status: Some(StepStatus::Skipped),
                        output: Some(format!("no command configured for step '{step_name}'")),
                        ..StepUpdate::default()
                    },
                );
                continue;
            };

            if !self.store.claim_step(workflow_id, &step_id) {
                // Another runner owns this step, or the workflow stopped.
                return self.store.get(workflow_id).map(|wf| wf.status);
            }

            let args = match render_args(args, &workflow.params) {
                Ok(args) => args,
                Err(reason) => {
                    warn!(id = workflow_id, step = %step_name, %reason, "workflow step not started");
                    self.store.update_step(
                        workflow_id,
                        &step_id,
                        StepUpdate {
                            status: Some(StepStatus::Failed),
                            error: Some(reason),
                            ..StepUpdate::default()
                        },
                    );
                    continue;
                },
            };
            let opts = InvokeOptions {
                timeout: self.step_timeout,
                cwd: None,
                cancel: Some(cancel.clone()),
            };
            let result = self.supervisor.gt_text(args, opts).await;

            let update = if result.success {
                StepUpdate {
                    status: Some(StepStatus::Completed),
                    output: result.data,
                    error: None,
                    duration: Some(result.duration),
                }
            } else {
                if result.kind() != Some(CliErrorKind::Cancelled) {
                    warn!(
                        id = workflow_id,
                        step = %step_name,
                        error = result.error.as_deref().unwrap_or_default(),
                        "workflow step failed"
                    );
                }
                StepUpdate {
                    status: Some(StepStatus::Failed),
                    output: None,
                    error: result.error,
                    duration: Some(result.duration),
                }
            };
            self.store.update_step(workflow_id, &step_id, update);
        }
    }
}

/// Substitute `{param}` placeholders inside each argv element.
///
/// A parameter may not turn a positional element into an option: an element
/// that did not start with `-` must not start with one after rendering.
fn render_args(args: &[String], params: &Map<String, Value>) -> Result<Vec<String>, String> {
    args.iter()
        .map(|arg| {
            let rendered = params.iter().fold(arg.clone(), |rendered, (key, value)| {
                let placeholder = format!("{{{key}}}");
                match value {
                    Value::String(text) => rendered.replace(&placeholder, text),
                    Value::Number(_) | Value::Bool(_) => {
                        rendered.replace(&placeholder, &value.to_string())
                    },
                    _ => rendered,
                }
            });
            if rendered.starts_with('-') && !arg.starts_with('-') {
                return Err(format!(
                    "argument '{arg}' renders to option-like value '{rendered}'"
                ));
            }
            Ok(rendered)
        })
        .collect()
}
