//! Tracking of asynchronous, poll-for-status operations.
//!
//! An operation represents one long-running CLI action (adding a rig,
//! fetching, merging) that the HTTP layer starts in the background. Clients
//! receive the id immediately and poll until the status is terminal.
//!
//! # Lifecycle
//!
//! ```text
//! create ──► Pending ──► Running ──► Completed
//!               │           ├──────► Failed
//!               └───────────┴──────► Cancelled   (via cancel + callback)
//! ```
//!
//! Terminal statuses are sinks: later status updates are rejected, which is
//! what keeps a cancelled operation cancelled when the killed process
//! reports back.

mod error;
pub mod runner;
mod state;
mod store;

#[cfg(test)]
mod tests;

pub use error::OperationError;
pub use runner::{OperationLaunch, spawn_cli_operation};
pub use state::{Operation, OperationStatus, OperationType};
pub use store::{
    CancelCallback, DEFAULT_MAX_AGE, OperationFilter, OperationStore, OperationUpdate,
};
