//! Bead (issue) endpoints.

use axum::Json;
use axum::extract::{Query, State};
use gtdash_core::supervisor::InvokeOptions;
use serde::Deserialize;
use serde_json::Value;

use super::{ApiResult, Envelope};
use crate::state::AppState;

/// Query of `GET /api/beads`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BeadsQuery {
    /// Passed to `bd list --status`.
    pub status: Option<String>,
}

/// `GET /api/beads`: `bd list --json`.
pub async fn list_beads(
    State(state): State<AppState>,
    Query(query): Query<BeadsQuery>,
) -> ApiResult<Json<Envelope<Value>>> {
    let mut args = vec!["list".to_string(), "--json".to_string()];
    if let Some(status) = query.status.filter(|s| !s.is_empty()) {
        args.push("--status".into());
        args.push(status);
    }

    let beads = state
        .supervisor
        .bd::<Value>(args, InvokeOptions::default())
        .await
        .into_result()?;
    Ok(Json(Envelope::fetched(beads)))
}
