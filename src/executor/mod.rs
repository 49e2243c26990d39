use crate::command::Invocation;
use crate::error::{PipelineError, Result};
use std::process::ExitStatus;
use tracing::debug;

/// Runs one invocation to completion and reports its exit code.
pub trait Executor {
    fn run(&self, invocation: &Invocation) -> Result<i32>;
}

/// Spawns the invocation as a child process and blocks until it exits.
/// The child resolves a relative `--outdir` against the driver's own cwd,
/// the same directory the driver creates and lists.
#[derive(Debug, Default, Clone)]
pub struct LocalExecutor;

impl LocalExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Executor for LocalExecutor {
    fn run(&self, invocation: &Invocation) -> Result<i32> {
        let mut cmd = invocation.to_command()?;
        debug!(command = %invocation, "spawning local stage");

        let status = cmd.status().map_err(|source| PipelineError::Spawn {
            command: invocation.to_string(),
            source,
        })?;
        Ok(exit_code(status))
    }
}

/// Exit code of a finished child; a signal-terminated child reports
/// `128 + signal` like a shell does.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}
