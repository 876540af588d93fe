//! Native command execution
//!
//! The [`CommandRunner`] trait is the only way the crate touches external
//! processes. [`SystemRunner`] spawns real tools through [`crate::elevation`];
//! tests swap in a scripted runner.
//!
//! Every invocation:
//! - passes an argv vector (no shell)
//! - runs with `LC_ALL=C` so output grammars are stable
//! - is bounded by a hard timeout, after which the child is killed

use crate::elevation::{ElevationError, create_elevated_command};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, warn};

/// Captured result of one process run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// The text a tool used to explain a failure: stderr, or stdout for
    /// tools (ufw) that report errors there.
    pub fn failure_message(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

/// Runner-level failures, before any output exists
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("{0} not found in PATH")]
    NotFound(String),

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error(transparent)]
    Elevation(#[from] ElevationError),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args`, killing it after `timeout`.
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, RunError>;

    /// Resolves `program` on `PATH` without running it.
    fn locate(&self, program: &str) -> Option<PathBuf>;
}

/// Runs real processes on the host
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, RunError> {
        if self.locate(program).is_none() {
            return Err(RunError::NotFound(program.to_string()));
        }

        let mut cmd = create_elevated_command(program, args)?;
        cmd.env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(program, ?args, "Dispatching native command");
        let child = cmd.spawn().map_err(|source| RunError::Spawn {
            program: program.to_string(),
            source,
        })?;

        // Dropping the wait future on timeout drops the child, which kills it
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Ok(Err(source)) => Err(RunError::Spawn {
                program: program.to_string(),
                source,
            }),
            Err(_) => {
                warn!(program, ?timeout, "Native command timed out and was killed");
                Err(RunError::Timeout {
                    program: program.to_string(),
                    timeout,
                })
            }
        }
    }

    fn locate(&self, program: &str) -> Option<PathBuf> {
        crate::utils::find_binary(program)
    }
}

/// Converts string literals into an owned argv
pub fn argv<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    args.into_iter().map(Into::into).collect()
}
