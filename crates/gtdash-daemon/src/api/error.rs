//! Error type for the HTTP API.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use gtdash_core::operation::OperationError;
use gtdash_core::result::{CliErrorKind, CliFailure};
use gtdash_core::workflow::WorkflowError;
use serde_json::json;
use thiserror::Error;
use tracing::warn;

/// Errors returned by API handlers.
///
/// Rendered as `{"error": {"code", "message"}}` with the status from
/// [`ApiError::status_code`].
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request was malformed.
    #[error("{0}")]
    BadRequest(String),

    /// Operation store rejected the request.
    #[error(transparent)]
    Operation(#[from] OperationError),

    /// Workflow store rejected the request.
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    /// A supervised CLI call failed.
    #[error("{}", .0.message)]
    Cli(#[from] CliFailure),
}

impl ApiError {
    /// Returns the HTTP status code for this error.
    ///
    /// - Unknown operation, workflow or step: 404 Not Found
    /// - Invalid state transition or input: 400 Bad Request
    /// - CLI `not_found`: 404, `timeout`: 504, `circuit_open` and
    ///   `queue_full`: 503, anything else: 500
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Operation(OperationError::NotFound { .. })
            | Self::Workflow(
                WorkflowError::WorkflowNotFound { .. } | WorkflowError::StepNotFound { .. },
            ) => StatusCode::NOT_FOUND,
            Self::Operation(_) | Self::Workflow(_) => StatusCode::BAD_REQUEST,
            Self::Cli(failure) => match failure.kind {
                CliErrorKind::NotFound => StatusCode::NOT_FOUND,
                CliErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
                CliErrorKind::CircuitOpen | CliErrorKind::QueueFull => {
                    StatusCode::SERVICE_UNAVAILABLE
                },
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Machine-readable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Operation(OperationError::NotFound { .. })
            | Self::Workflow(
                WorkflowError::WorkflowNotFound { .. } | WorkflowError::StepNotFound { .. },
            ) => "not_found",
            Self::Operation(OperationError::NotCancellable { .. })
            | Self::Workflow(WorkflowError::NotCancellable { .. }) => "not_cancellable",
            Self::Operation(OperationError::NoCancelHandler { .. }) => "no_cancel_handler",
            Self::Workflow(WorkflowError::StepNotRetryable { .. }) => "not_retryable",
            Self::Workflow(WorkflowError::WorkflowCancelled { .. }) => "workflow_cancelled",
            Self::Operation(_) | Self::Workflow(_) => "invalid_state",
            Self::Cli(failure) => failure.kind.as_str(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!(code = self.code(), error = %self, "request failed");
        }
        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}
