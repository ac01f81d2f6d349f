//! Liveness and metrics endpoints.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use gtdash_core::breaker::CircuitState;
use gtdash_core::supervisor::SupervisorStats;
use serde::Serialize;
use tracing::error;

use super::Envelope;
use crate::state::AppState;

/// Body of `GET /api/health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// `ok`, or `degraded` while a circuit is not closed.
    pub status: &'static str,
    /// Seconds since startup.
    pub uptime_secs: u64,
    /// Queue and breaker state.
    pub supervisor: SupervisorStats,
}

/// `GET /api/health`
pub async fn health(State(state): State<AppState>) -> Json<Envelope<HealthReport>> {
    let supervisor = state.supervisor.stats();
    let breakers = &supervisor.circuit_breaker;
    let status = if breakers.gt.state == CircuitState::Closed
        && breakers.bd.state == CircuitState::Closed
    {
        "ok"
    } else {
        "degraded"
    };

    Json(Envelope::new(HealthReport {
        status,
        uptime_secs: state.uptime_secs(),
        supervisor,
    }))
}

/// `GET /metrics`
pub async fn metrics(State(state): State<AppState>) -> Response {
    state
        .metrics
        .metrics()
        .observe_supervisor(&state.supervisor.stats());

    match state.metrics.encode_text() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {e}"),
            )
                .into_response()
        },
    }
}
