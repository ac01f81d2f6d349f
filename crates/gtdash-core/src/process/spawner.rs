//! Argv-only child launch for supervised CLI calls.
//!
//! A [`CommandSpec`] is turned into a `tokio` child with piped stdout and
//! stderr and a closed stdin. Nothing here waits on the child; the
//! supervisor owns capture, deadlines and killing.

use std::io::ErrorKind;
use std::process::Stdio;

use tokio::process::{Child, Command};

use super::{CommandSpec, ProcessError};

/// Live child handed back to the supervisor.
pub struct SpawnedProcess {
    /// Handle with piped stdout and stderr; killed when dropped.
    pub child: Child,
    /// PID read right after launch, for log correlation.
    pub pid: u32,
}

/// Launch `spec.program` with `spec.args` as literal argv entries.
///
/// No shell sits between the caller and the child, so each element of
/// `spec.args` is received as exactly one argument, metacharacters and all.
/// The child is killed if its handle is dropped.
///
/// # Errors
///
/// `ProcessError::BinaryNotFound` when the program cannot be resolved;
/// `ProcessError::SpawnFailed` for a missing working directory or any other
/// launch failure.
pub fn spawn(spec: &CommandSpec) -> Result<SpawnedProcess, ProcessError> {
    let program = spec.program.to_string_lossy().into_owned();

    if let Some(dir) = spec.cwd.as_deref() {
        if !dir.is_dir() {
            return Err(ProcessError::SpawnFailed {
                program,
                reason: format!("working directory does not exist: {}", dir.display()),
            });
        }
    }

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(spec.env.iter().map(|(key, value)| (key, value)))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = spec.cwd.as_deref() {
        command.current_dir(dir);
    }

    let child = command.spawn().map_err(|err| {
        if err.kind() == ErrorKind::NotFound {
            ProcessError::BinaryNotFound {
                program: program.clone(),
            }
        } else {
            ProcessError::SpawnFailed {
                program: program.clone(),
                reason: err.to_string(),
            }
        }
    })?;

    // `id()` is only `None` once the child has been reaped.
    let Some(pid) = child.id() else {
        return Err(ProcessError::SpawnFailed {
            program,
            reason: "child exited before its pid could be read".to_string(),
        });
    };

    Ok(SpawnedProcess { child, pid })
}
