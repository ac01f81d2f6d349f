//! Workflow endpoints.
//!
//! Creating a workflow and retrying a step both start a background run;
//! clients poll `GET /api/workflows/:id` for progress.

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use gtdash_core::workflow::{Workflow, WorkflowError, WorkflowFilter, WorkflowType};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;

use super::{ApiError, ApiResult, Envelope};
use crate::state::AppState;

/// Body of `POST /api/workflows`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateWorkflowRequest {
    /// Template.
    #[serde(rename = "type")]
    pub workflow_type: WorkflowType,
    /// Display name.
    pub name: String,
    /// Parameters, substituted into step commands.
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Step names; only for `custom` workflows.
    #[serde(default)]
    pub steps: Option<Vec<String>>,
}

/// Body of `POST /api/workflows/:id/retry`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRequest {
    /// Step to retry.
    pub step_id: String,
}

/// `GET /api/workflows?status=&type=`
pub async fn list_workflows(
    State(state): State<AppState>,
    filter: Result<Query<WorkflowFilter>, QueryRejection>,
) -> ApiResult<Json<Envelope<Vec<Workflow>>>> {
    let Query(filter) = filter.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    Ok(Json(Envelope::fetched(state.workflows.list(&filter))))
}

/// `POST /api/workflows`: create a workflow and start running it.
pub async fn create_workflow(
    State(state): State<AppState>,
    payload: Result<Json<CreateWorkflowRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Envelope<Workflow>>)> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let name = request.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("name is required".into()));
    }

    let workflow = match (request.workflow_type, request.steps) {
        (WorkflowType::Custom, Some(steps)) => {
            if steps.iter().any(|step| step.trim().is_empty()) {
                return Err(ApiError::BadRequest("step names must not be empty".into()));
            }
            state.workflows.create_custom(name, &steps, request.params)
        },
        (WorkflowType::Custom, None) => {
            state
                .workflows
                .create(WorkflowType::Custom, name, request.params)
        },
        (_, Some(_)) => {
            return Err(ApiError::BadRequest(
                "steps can only be given for custom workflows".into(),
            ));
        },
        (workflow_type, None) => state.workflows.create(workflow_type, name, request.params),
    };

    info!(id = %workflow.id, kind = %workflow.workflow_type, "workflow created");
    start_run(&state, &workflow);
    Ok((StatusCode::CREATED, Json(Envelope::new(workflow))))
}

/// `GET /api/workflows/:id`
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Envelope<Workflow>>> {
    let workflow = state
        .workflows
        .get(&id)
        .ok_or(WorkflowError::WorkflowNotFound { id })?;
    Ok(Json(Envelope::fetched(workflow)))
}

/// `POST /api/workflows/:id/retry`: reset a failed step and resume.
pub async fn retry_step(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<RetryRequest>, JsonRejection>,
) -> ApiResult<Json<Envelope<Workflow>>> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    state.workflows.retry_step(&id, &request.step_id)?;
    let workflow = state
        .workflows
        .get(&id)
        .ok_or(WorkflowError::WorkflowNotFound { id })?;

    start_run(&state, &workflow);
    Ok(Json(Envelope::new(workflow)))
}

/// `POST /api/workflows/:id/cancel`
pub async fn cancel_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Envelope<Workflow>>> {
    state.workflows.cancel(&id)?;
    let workflow = state
        .workflows
        .get(&id)
        .ok_or(WorkflowError::WorkflowNotFound { id })?;
    Ok(Json(Envelope::new(workflow)))
}

fn start_run(state: &AppState, workflow: &Workflow) {
    state
        .metrics
        .metrics()
        .workflow_started(workflow.workflow_type);
    // Progress is observed through the store; the handle is not awaited.
    drop(state.runner.spawn(workflow.id.clone()));
}
