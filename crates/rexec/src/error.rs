//! Error types for rexec

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during command execution
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// Invalid configuration, detected before any I/O
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// Failed to connect to remote host
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication failed
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// SSH key error
    #[error("SSH key error: {0}")]
    SshKeyError(String),

    /// Command rejected by validation
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// Command text could not be split into arguments
    #[error("failed to parse command: {0}")]
    ParseCommand(String),

    /// Command was already claimed by another execution
    #[error("command has already been executed")]
    AlreadyStarted,

    /// Execution was canceled by the caller
    #[error("execution canceled")]
    Canceled,

    /// Command timed out
    #[error("command timed out after {timeout:?}")]
    Timeout {
        /// Timeout duration that was exceeded
        timeout: Duration,
    },

    /// Command ran and exited with a non-zero status
    #[error("process exited with status {status}")]
    Exit {
        /// Exit status code
        status: i32,
    },

    /// Command was terminated by a signal
    #[error("process terminated by signal {0}")]
    Signaled(String),

    /// Process spawn error
    #[error("failed to spawn process: {0}")]
    SpawnError(String),

    /// I/O error during execution
    #[error("I/O error: {0}")]
    IoError(String),

    /// Connection manager has been closed
    #[error("connection manager is closed")]
    Closed,

    /// `close()` called more than once
    #[error("already closed")]
    AlreadyClosed,
}

impl ExecError {
    /// Check if error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecError::ConnectionFailed(_) | ExecError::Timeout { .. }
        )
    }

    /// Exit code carried by a runtime exit error
    #[must_use]
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            ExecError::Exit { status } => Some(*status),
            _ => None,
        }
    }
}

impl From<russh::Error> for ExecError {
    fn from(e: russh::Error) -> Self {
        ExecError::IoError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(ExecError::ConnectionFailed("refused".into()).is_retryable());
        assert!(
            ExecError::Timeout {
                timeout: Duration::from_secs(1)
            }
            .is_retryable()
        );
        assert!(!ExecError::ConfigError("addr is empty".into()).is_retryable());
        assert!(!ExecError::InvalidCommand("empty".into()).is_retryable());
    }

    #[test]
    fn test_exit_status() {
        assert_eq!(ExecError::Exit { status: 3 }.exit_status(), Some(3));
        assert_eq!(ExecError::Canceled.exit_status(), None);
    }
}
