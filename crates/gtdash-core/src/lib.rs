//! gtdash-core - CLI supervision for the Gas Town dashboard backend.
//!
//! The dashboard reads and mutates its state by invoking two external
//! command line tools, `gt` and `bd`. This crate owns every such invocation
//! and the bookkeeping for long-running work started through them.
//!
//! # Modules
//!
//! - [`result`]: the [`CliResult`] envelope every invocation returns
//! - [`process`]: argv-only process spawning with deadlines and cancellation
//! - [`breaker`]: consecutive-failure circuit breaker
//! - [`supervisor`]: bounded FIFO queue and per-binary breakers around the
//!   process layer
//! - [`operation`]: tracked background operations polled by clients
//! - [`workflow`]: tracked multi-step pipelines
//! - [`config`]: TOML configuration
//!
//! # Example
//!
//! ```rust,no_run
//! use gtdash_core::supervisor::{InvokeOptions, ProcessSupervisor, SupervisorConfig};
//!
//! # async fn example() {
//! let supervisor = ProcessSupervisor::new(SupervisorConfig::default());
//! let rigs = supervisor
//!     .gt::<serde_json::Value>(["rig", "list", "--json"], InvokeOptions::default())
//!     .await;
//! if !rigs.success {
//!     eprintln!("{}: {}", rigs.command, rigs.error.unwrap_or_default());
//! }
//! # }
//! ```

pub mod breaker;
pub mod config;
pub mod id;
pub mod operation;
pub mod process;
pub mod result;
pub mod supervisor;
pub mod workflow;

pub use config::DashboardConfig;
pub use process::Binary;
pub use result::{CliErrorKind, CliFailure, CliResult};
pub use supervisor::ProcessSupervisor;
