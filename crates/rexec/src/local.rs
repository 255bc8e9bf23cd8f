//! Local command execution using `tokio::process`

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio as ProcessStdio};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command as Process};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::command::Command;
use crate::coordinator::{Execution, coordinate, race};
use crate::error::ExecError;
use crate::io::Stdio;
use crate::traits::Executor;

/// Local command executor
///
/// Spawns the program directly, without a shell. The command text is split
/// with shell quoting rules, so `grep 'a b' file` runs `grep` with two
/// arguments, but pipes, redirections and variables are not interpreted.
/// The working directory and environment are applied to the process itself.
#[derive(Debug, Clone, Default)]
pub struct LocalExecutor;

impl LocalExecutor {
    /// Create a new local executor
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    #[instrument(skip(self, cancel, cmd), fields(command = %cmd.command()), level = "debug")]
    async fn execute(&self, cancel: &CancellationToken, cmd: &Command) -> Result<(), ExecError> {
        coordinate(self.executor_type(), cancel, cmd, |stdio| async move {
            let argv = cmd.argv()?;

            let mut process = Process::new(&argv[0]);
            process.args(&argv[1..]).envs(cmd.env());
            if let Some(dir) = cmd.workdir() {
                process.current_dir(dir);
            }

            debug!(program = %argv[0], args = ?&argv[1..], "spawning process");
            let mut execution = ProcessExecution::spawn(process, stdio)?;
            race(cancel, &mut execution).await
        })
        .await
    }

    fn executor_type(&self) -> &'static str {
        "local"
    }
}

/// Executor running commands through a shell: `<shell> <args...> "<line>"`
///
/// The line is [`Command::shell_string`], so the working directory and
/// environment are applied by the shell (`cd ... && export ... && cmd`)
/// while the shell process itself inherits the caller's. The shell can be
/// anything that takes a command line as its last argument, e.g.
/// `/bin/bash -c` or `ssh -T user@host`.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    /// Shell binary
    shell_path: PathBuf,
    /// Arguments placed before the command line
    shell_args: Vec<String>,
}

impl ShellExecutor {
    /// Create a shell executor
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` if `shell_path` is empty
    pub fn new(shell_path: impl Into<PathBuf>, shell_args: Vec<String>) -> Result<Self, ExecError> {
        let shell_path = shell_path.into();
        if shell_path.as_os_str().is_empty() {
            return Err(ExecError::ConfigError("shell path is empty".to_string()));
        }
        Ok(Self {
            shell_path,
            shell_args,
        })
    }
}

impl Default for ShellExecutor {
    /// `/bin/sh -c`
    fn default() -> Self {
        Self {
            shell_path: PathBuf::from("/bin/sh"),
            shell_args: vec!["-c".to_string()],
        }
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    #[instrument(skip(self, cancel, cmd), fields(shell = %self.shell_path.display(), command = %cmd.command()), level = "debug")]
    async fn execute(&self, cancel: &CancellationToken, cmd: &Command) -> Result<(), ExecError> {
        coordinate(self.executor_type(), cancel, cmd, |stdio| async move {
            let line = cmd.shell_string();

            let mut process = Process::new(&self.shell_path);
            process.args(&self.shell_args).arg(&line);

            debug!(line = %line, "spawning shell");
            let mut execution = ProcessExecution::spawn(process, stdio)?;
            race(cancel, &mut execution).await
        })
        .await
    }

    fn executor_type(&self) -> &'static str {
        "shell"
    }
}

/// A spawned child process with its streams being pumped
pub(crate) struct ProcessExecution {
    child: Child,
    stdin_pump: Option<JoinHandle<()>>,
    output_pumps: Vec<JoinHandle<std::io::Result<u64>>>,
}

impl ProcessExecution {
    /// Spawn `process` with piped streams wired to `stdio`
    pub(crate) fn spawn(mut process: Process, stdio: Stdio) -> Result<Self, ExecError> {
        process
            .stdin(ProcessStdio::piped())
            .stdout(ProcessStdio::piped())
            .stderr(ProcessStdio::piped())
            .kill_on_drop(true);

        let mut child = process
            .spawn()
            .map_err(|e| ExecError::SpawnError(e.to_string()))?;

        let Stdio {
            mut stdin,
            stdout,
            stderr,
        } = stdio;

        let stdin_pump = child.stdin.take().map(|mut child_stdin| {
            tokio::spawn(async move {
                if let Err(e) = tokio::io::copy(&mut stdin, &mut child_stdin).await {
                    debug!(error = %e, "stdin pump stopped");
                }
                // dropping child_stdin closes the pipe
            })
        });

        let mut output_pumps = Vec::with_capacity(2);
        if let Some(child_stdout) = child.stdout.take() {
            output_pumps.push(tokio::spawn(pump(child_stdout, stdout)));
        }
        if let Some(child_stderr) = child.stderr.take() {
            output_pumps.push(tokio::spawn(pump(child_stderr, stderr)));
        }

        Ok(Self {
            child,
            stdin_pump,
            output_pumps,
        })
    }
}

#[async_trait]
impl Execution for ProcessExecution {
    async fn wait(&mut self) -> Result<(), ExecError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        for pump in self.output_pumps.drain(..) {
            match pump.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "failed to forward process output"),
                Err(e) => warn!(error = %e, "output pump task failed"),
            }
        }
        if let Some(pump) = self.stdin_pump.take() {
            pump.abort();
        }

        exit_result(status)
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "failed to kill process");
        }
        if let Some(pump) = self.stdin_pump.take() {
            pump.abort();
        }
    }
}

async fn pump<R, W>(mut from: R, mut to: W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let n = tokio::io::copy(&mut from, &mut to).await?;
    to.flush().await?;
    Ok(n)
}

fn exit_result(status: ExitStatus) -> Result<(), ExecError> {
    match status.code() {
        Some(0) => Ok(()),
        Some(code) => Err(ExecError::Exit { status: code }),
        None => Err(ExecError::Signaled(status.to_string())),
    }
}
