//! gtdash-daemon - HTTP backend for the Gas Town dashboard.
//!
//! The daemon exposes the supervised `gt`/`bd` CLIs and the operation and
//! workflow stores from [`gtdash_core`] as a small JSON API.
//!
//! # Modules
//!
//! - [`api`]: axum router and request handlers
//! - [`metrics`]: Prometheus metrics
//! - [`state`]: shared state handed to every handler

pub mod api;
pub mod metrics;
pub mod state;

pub use api::router;
pub use state::AppState;
