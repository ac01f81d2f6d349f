//! Multi-step workflow tracking.
//!
//! A workflow is a fixed, ordered list of steps created from a template
//! (`merge-deploy`, `test-merge`, `full-ci`) or supplied by the caller
//! (`custom`). Steps are never reordered or added after creation.
//!
//! # Status derivation
//!
//! ```text
//! any step failed                    ──► Failed
//! every step completed or skipped    ──► Completed
//! a step left pending while Pending  ──► Running
//! ```
//!
//! A failed step can be retried: it returns to `pending` and a failed
//! workflow returns to `running`, after which [`WorkflowRunner`] resumes from
//! that step.

mod error;
pub mod runner;
mod state;
mod store;

#[cfg(test)]
mod tests;

pub use error::WorkflowError;
pub use runner::WorkflowRunner;
pub use state::{StepStatus, Workflow, WorkflowStatus, WorkflowStep, WorkflowType};
pub use store::{StepUpdate, WorkflowFilter, WorkflowStore};
