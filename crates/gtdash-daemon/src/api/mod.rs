//! JSON HTTP API.
//!
//! | Route | Handler |
//! |-------|---------|
//! | `GET /api/health` | [`health::health`] |
//! | `GET /api/rigs`, `POST /api/rigs` | [`rigs::list_rigs`], [`rigs::add_rig`] |
//! | `GET /api/beads` | [`beads::list_beads`] |
//! | `GET /api/operations` | [`operations::list_operations`] |
//! | `GET /api/operations/:id` | [`operations::get_operation`] |
//! | `POST /api/operations/:id/cancel` | [`operations::cancel_operation`] |
//! | `GET /api/workflows`, `POST /api/workflows` | [`workflows::list_workflows`], [`workflows::create_workflow`] |
//! | `GET /api/workflows/:id` | [`workflows::get_workflow`] |
//! | `POST /api/workflows/:id/retry` | [`workflows::retry_step`] |
//! | `POST /api/workflows/:id/cancel` | [`workflows::cancel_workflow`] |
//! | `GET /metrics` | [`health::metrics`] |
//!
//! Successful responses wrap their payload in [`Envelope`]; failures are
//! rendered by [`ApiError`].

use axum::Router;
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state::AppState;

pub mod beads;
mod error;
pub mod health;
pub mod operations;
pub mod rigs;
pub mod workflows;

pub use error::ApiError;

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// Response body wrapper.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<T> {
    /// The payload.
    pub data: T,
    /// Response metadata, on read endpoints.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

/// Metadata attached to read responses.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    /// When the data was read.
    pub fetched_at: DateTime<Utc>,
}

impl<T> Envelope<T> {
    /// Wrap `data` without metadata.
    pub const fn new(data: T) -> Self {
        Self { data, meta: None }
    }

    /// Wrap `data` stamped with the current time.
    pub fn fetched(data: T) -> Self {
        Self {
            data,
            meta: Some(Meta {
                fetched_at: Utc::now(),
            }),
        }
    }
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health::health))
        .route("/api/rigs", get(rigs::list_rigs).post(rigs::add_rig))
        .route("/api/beads", get(beads::list_beads))
        .route("/api/operations", get(operations::list_operations))
        .route("/api/operations/:id", get(operations::get_operation))
        .route(
            "/api/operations/:id/cancel",
            post(operations::cancel_operation),
        )
        .route(
            "/api/workflows",
            get(workflows::list_workflows).post(workflows::create_workflow),
        )
        .route("/api/workflows/:id", get(workflows::get_workflow))
        .route("/api/workflows/:id/retry", post(workflows::retry_step))
        .route("/api/workflows/:id/cancel", post(workflows::cancel_workflow))
        .route("/metrics", get(health::metrics))
        .with_state(state)
}
