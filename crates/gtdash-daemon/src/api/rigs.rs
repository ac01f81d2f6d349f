//! Rig endpoints.

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use gtdash_core::operation::{OperationLaunch, OperationType, spawn_cli_operation};
use gtdash_core::process::Binary;
use gtdash_core::supervisor::InvokeOptions;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use super::{ApiError, ApiResult, Envelope};
use crate::state::{AppState, RIG_ADD_TIMEOUT};

/// Body of `POST /api/rigs`.
#[derive(Debug, Clone, Deserialize)]
pub struct AddRigRequest {
    /// Rig name.
    #[serde(default)]
    pub name: String,
    /// Git URL to clone.
    #[serde(default)]
    pub url: String,
}

/// Response of an accepted background request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Accepted {
    /// Always `accepted`.
    pub status: &'static str,
    /// Operation to poll.
    pub operation_id: String,
    /// Where to poll it.
    pub check_status: String,
}

/// `GET /api/rigs`: `gt rig list --json`.
pub async fn list_rigs(State(state): State<AppState>) -> ApiResult<Json<Envelope<Value>>> {
    let rigs = state
        .supervisor
        .gt::<Value>(["rig", "list", "--json"], InvokeOptions::default())
        .await
        .into_result()?;
    Ok(Json(Envelope::fetched(rigs)))
}

/// `POST /api/rigs`: start `gt rig add <name> <url>` as an operation.
pub async fn add_rig(
    State(state): State<AppState>,
    payload: Result<Json<AddRigRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Accepted>)> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let name = request.name.trim();
    let url = request.url.trim();
    if name.is_empty() || url.is_empty() {
        return Err(ApiError::BadRequest("name and url are required".into()));
    }
    // Both land as positional argv entries; gt would parse `-x` as a flag.
    if name.starts_with('-') || url.starts_with('-') {
        return Err(ApiError::BadRequest(
            "name and url must not start with '-'".into(),
        ));
    }

    let mut metadata = Map::new();
    metadata.insert("name".into(), Value::from(name));
    metadata.insert("url".into(), Value::from(url));

    let operation = spawn_cli_operation(
        &state.operations,
        &state.supervisor,
        OperationLaunch {
            operation_type: OperationType::RigAdd,
            metadata,
            binary: Binary::Gt,
            args: vec!["rig".into(), "add".into(), name.into(), url.into()],
            timeout: Some(RIG_ADD_TIMEOUT),
            cwd: None,
        },
    );
    state
        .metrics
        .metrics()
        .operation_started(OperationType::RigAdd);
    info!(id = %operation.id, rig = name, "rig add accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            status: "accepted",
            check_status: format!("/api/operations/{}", operation.id),
            operation_id: operation.id,
        }),
    ))
}
