//! Result types for command execution

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command::{Command, STATUS_UNKNOWN};
use crate::io::ManagedIo;

/// Collected output of a command run through [`crate::Executor::run`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    /// Exit status code (0 for success, -1 when unknown)
    pub status: i32,
    /// stdout output
    pub stdout: String,
    /// stderr output
    pub stderr: String,
    /// Time taken to execute
    pub duration: Duration,
}

impl CommandResult {
    /// Snapshot a finished command whose streams were captured by `io`
    #[must_use]
    pub fn captured(cmd: &Command, io: &ManagedIo, duration: Duration) -> Self {
        Self {
            status: cmd.status().unwrap_or(STATUS_UNKNOWN),
            stdout: io.stdout.to_string_lossy(),
            stderr: io.stderr.to_string_lossy(),
            duration,
        }
    }

    /// Check if command succeeded (exit code 0)
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == 0
    }
}
