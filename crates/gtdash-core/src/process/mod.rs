//! External CLI process execution.
//!
//! Commands are always described as a program plus an argument vector and
//! executed without an intermediate shell, so argument content is never
//! interpreted: `;`, `$()`, backticks and `&&` reach the child verbatim.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod runner;
pub mod spawner;

pub use runner::{MAX_CAPTURED_OUTPUT, RawOutput, run_to_completion};
pub use spawner::{SpawnedProcess, spawn};

/// The external binaries the dashboard is allowed to invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Binary {
    /// Orchestration CLI.
    Gt,
    /// Issue-tracking CLI.
    Bd,
}

impl Binary {
    /// All binaries, in a stable order.
    pub const ALL: [Self; 2] = [Self::Gt, Self::Bd];

    /// Returns the alias used in logs and stats.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Gt => "gt",
            Self::Bd => "bd",
        }
    }
}

impl fmt::Display for Binary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully-resolved command: program path, argv, working directory and
/// extra environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program to execute (looked up in `PATH` when not absolute).
    pub program: PathBuf,
    /// Arguments, passed one-to-one as argv elements.
    pub args: Vec<String>,
    /// Working directory for the child.
    pub cwd: Option<PathBuf>,
    /// Additional environment variables.
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    /// Starts building a command for `program`.
    #[must_use]
    pub fn builder(program: impl Into<PathBuf>) -> CommandSpecBuilder {
        CommandSpecBuilder {
            spec: Self {
                program: program.into(),
                args: Vec::new(),
                cwd: None,
                env: Vec::new(),
            },
        }
    }

    /// Renders the command line for logs and result envelopes.
    ///
    /// Arguments containing whitespace or shell metacharacters are quoted so
    /// the rendered line reads unambiguously. The rendering is display-only.
    #[must_use]
    pub fn display(&self) -> String {
        let program = self.program.to_string_lossy();
        let mut line = String::from(program.as_ref());
        for arg in &self.args {
            line.push(' ');
            line.push_str(&quote_for_display(arg));
        }
        line
    }
}

/// Builder for [`CommandSpec`].
#[derive(Debug, Clone)]
pub struct CommandSpecBuilder {
    spec: CommandSpec,
}

impl CommandSpecBuilder {
    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.spec.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.spec.cwd = cwd;
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.env.push((key.into(), value.into()));
        self
    }

    /// Finishes the builder.
    #[must_use]
    pub fn build(self) -> CommandSpec {
        self.spec
    }
}

fn quote_for_display(arg: &str) -> String {
    const SPECIAL: &[char] = &[
        ' ', '\t', '\n', '"', '\'', '\\', '$', '`', ';', '&', '|', '<', '>', '(', ')', '*', '?',
    ];
    if !arg.is_empty() && !arg.contains(SPECIAL) {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Errors from spawning or running a child process.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProcessError {
    /// The program does not exist or is not on `PATH`.
    #[error("binary not found: {program}")]
    BinaryNotFound {
        /// The program that could not be resolved.
        program: String,
    },

    /// The OS refused to start the process.
    #[error("failed to spawn {program}: {reason}")]
    SpawnFailed {
        /// The program that failed to start.
        program: String,
        /// Underlying OS error.
        reason: String,
    },

    /// The process outlived its deadline and was killed.
    #[error("timed out after {}ms", .timeout.as_millis())]
    Timeout {
        /// The deadline that was exceeded.
        timeout: Duration,
    },

    /// The caller cancelled the invocation; the process was killed.
    #[error("cancelled")]
    Cancelled,

    /// Waiting on the child or reading its output failed.
    #[error("i/o error while running process: {0}")]
    Io(String),
}
