//! Executor trait

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::command::Command;
use crate::error::ExecError;
use crate::io::ManagedIo;
use crate::result::CommandResult;

/// Runs [`Command`]s
///
/// Every implementation follows the same contract:
///
/// - a cancelled token fails fast with `ExecError::Canceled`
/// - a command already claimed by another call fails with
///   `ExecError::AlreadyStarted` and is left untouched
/// - otherwise the command is validated, executed, and its status recorded
///   exactly once: 0 on success, the exit code when the program exits
///   non-zero (`ExecError::Exit`), -1 for every other outcome
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute `cmd`, returning when it finishes or `cancel` fires
    async fn execute(&self, cancel: &CancellationToken, cmd: &Command) -> Result<(), ExecError>;

    /// Release resources held by the executor
    async fn close(&self) -> Result<(), ExecError> {
        Ok(())
    }

    /// Short name of the executor kind, for logs
    fn executor_type(&self) -> &'static str;

    /// Run a command line and collect its output
    ///
    /// A non-zero exit status is reported in the result, not as an error.
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        collect(self, &CancellationToken::new(), cmd).await
    }

    /// Like [`Executor::run`], cancelling the command after `timeout_duration`
    async fn run_with_timeout(
        &self,
        cmd: &str,
        timeout_duration: Duration,
    ) -> Result<CommandResult, ExecError> {
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let run = collect(self, &cancel, cmd);
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => result,
            () = tokio::time::sleep(timeout_duration) => {
                cancel.cancel();
                match run.await {
                    Err(ExecError::Canceled) => {
                        error!(
                            command = %cmd,
                            timeout = ?timeout_duration,
                            elapsed = ?start.elapsed(),
                            "command timed out"
                        );
                        Err(ExecError::Timeout {
                            timeout: timeout_duration,
                        })
                    }
                    other => other,
                }
            }
        }
    }
}

async fn collect<E: Executor + ?Sized>(
    executor: &E,
    cancel: &CancellationToken,
    cmd: &str,
) -> Result<CommandResult, ExecError> {
    let managed = ManagedIo::new();
    let mut command = Command::new(cmd);
    managed.hijack(&mut command);

    let start = Instant::now();
    match executor.execute(cancel, &command).await {
        Ok(()) | Err(ExecError::Exit { .. }) => Ok(CommandResult::captured(
            &command,
            &managed,
            start.elapsed(),
        )),
        Err(e) => Err(e),
    }
}
