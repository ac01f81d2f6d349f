//! Operation store error types.

use thiserror::Error;

use super::state::OperationStatus;

/// Errors returned by [`super::OperationStore::cancel`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum OperationError {
    /// No operation with this id.
    #[error("operation not found: {id}")]
    NotFound {
        /// The requested id.
        id: String,
    },

    /// The operation already finished.
    #[error("operation {id} cannot be cancelled in status {status}")]
    NotCancellable {
        /// The operation id.
        id: String,
        /// Its current status.
        status: OperationStatus,
    },

    /// Nothing was registered that could stop the operation.
    #[error("operation {id} has no cancel handler")]
    NoCancelHandler {
        /// The operation id.
        id: String,
    },
}
