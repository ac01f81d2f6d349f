//! Operation polling and cancellation.

use axum::Json;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use gtdash_core::operation::{Operation, OperationError, OperationFilter};
use serde::Serialize;

use super::{ApiError, ApiResult, Envelope};
use crate::state::AppState;

/// Body of a successful cancel.
#[derive(Debug, Clone, Serialize)]
pub struct Cancelled {
    /// Always true.
    pub cancelled: bool,
    /// The cancelled operation.
    pub id: String,
}

/// `GET /api/operations?status=&type=`
pub async fn list_operations(
    State(state): State<AppState>,
    filter: Result<Query<OperationFilter>, QueryRejection>,
) -> ApiResult<Json<Envelope<Vec<Operation>>>> {
    let Query(filter) = filter.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    Ok(Json(Envelope::fetched(state.operations.list(&filter))))
}

/// `GET /api/operations/:id`
pub async fn get_operation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Envelope<Operation>>> {
    let operation = state
        .operations
        .get(&id)
        .ok_or(OperationError::NotFound { id })?;
    Ok(Json(Envelope::fetched(operation)))
}

/// `POST /api/operations/:id/cancel`
pub async fn cancel_operation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Envelope<Cancelled>>> {
    state.operations.cancel(&id)?;
    Ok(Json(Envelope::new(Cancelled {
        cancelled: true,
        id,
    })))
}
