//! Execution state machine shared by every executor
//!
//! ```text
//! Unstarted --claim--> Running --+--> Succeeded (status 0)
//!                                +--> Failed    (exit code, or -1)
//!                                +--> Canceled  (-1)
//! ```
//!
//! The claim is a compare-and-swap on the command's start flag, so exactly
//! one of any number of concurrent callers gets past it. Backends only
//! provide the "run" step; claiming, validation, status derivation and the
//! race against cancellation live here so that every backend reports the
//! same statuses for the same outcomes.

use std::future::Future;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::{Command, STATUS_UNKNOWN};
use crate::error::ExecError;
use crate::io::Stdio;

/// A started process or remote command
#[async_trait]
pub trait Execution: Send {
    /// Wait for the command to finish
    ///
    /// Returns `Ok(())` for exit status 0 and `ExecError::Exit` for any
    /// other exit status.
    async fn wait(&mut self) -> Result<(), ExecError>;

    /// Ask the command to terminate, without waiting for it to do so
    async fn kill(&mut self);
}

/// Map the outcome of an execution to the recorded exit status
#[must_use]
pub fn derive_status(result: &Result<(), ExecError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(ExecError::Exit { status }) => *status,
        Err(_) => STATUS_UNKNOWN,
    }
}

/// Claim, validate and run `cmd`, then record its status
///
/// `run` receives the command's streams and performs the backend specific
/// work; it is only called for the single caller that claimed the command
/// and only after validation passed.
pub(crate) async fn coordinate<F, Fut>(
    executor: &'static str,
    cancel: &CancellationToken,
    cmd: &Command,
    run: F,
) -> Result<(), ExecError>
where
    F: FnOnce(Stdio) -> Fut,
    Fut: Future<Output = Result<(), ExecError>>,
{
    if cancel.is_cancelled() {
        info!(executor, "skipping execution: already canceled");
        return Err(ExecError::Canceled);
    }

    if !cmd.claim() {
        warn!(executor, "reject execution: command already started");
        return Err(ExecError::AlreadyStarted);
    }

    debug!(executor, "executing command");

    if let Err(e) = cmd.validate() {
        warn!(executor, error = %e, "reject execution: invalid command");
        cmd.set_status(STATUS_UNKNOWN);
        return Err(e);
    }

    let result = run(cmd.take_stdio()).await;
    let status = derive_status(&result);
    cmd.set_status(status);

    match &result {
        Ok(()) => info!(executor, status, "command execution succeeded"),
        Err(e) => warn!(executor, status, error = %e, "command execution failed"),
    }
    result
}

/// Wait for `execution`, or kill it as soon as `cancel` fires
pub(crate) async fn race<E>(cancel: &CancellationToken, execution: &mut E) -> Result<(), ExecError>
where
    E: Execution + ?Sized,
{
    let finished = tokio::select! {
        result = execution.wait() => Some(result),
        () = cancel.cancelled() => None,
    };

    match finished {
        Some(result) => {
            debug!(?result, "execution finished");
            result
        }
        None => {
            debug!("cancellation requested, killing execution");
            execution.kill().await;
            Err(ExecError::Canceled)
        }
    }
}
