//! Command description shared by all executors

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::warn;

use crate::error::ExecError;
use crate::io::{InputStream, OutputStream, Stdio};

/// Substrings rejected in the working directory
pub const WORKDIR_DANGEROUS: &[&str] = &[
    "\n", "\t", "\r", "\u{8}", " ", ";", "&", "|", "<", ">", "`", "(", ")", "{", "}", "[", "]",
    "$", "~",
];

/// Substrings rejected in environment keys and values
pub const ENV_DANGEROUS: &[&str] = WORKDIR_DANGEROUS;

/// Substrings rejected in the command text
pub const COMMAND_DANGEROUS: &[&str] = &[":(){ :|:& };:"];

/// Status recorded when a command did not finish with a known exit code
pub const STATUS_UNKNOWN: i32 = -1;

/// A command to run, locally or on a remote host
///
/// Behaves like the shell line
///
/// ```text
/// cd <workdir> && export <key>=<value> && ... && <command> < stdin > stdout 2> stderr
/// ```
///
/// although each executor decides how the working directory and environment
/// are actually applied. A `Command` can be executed once: the first executor
/// to claim it consumes its streams and records its exit status, every later
/// attempt fails with [`ExecError::AlreadyStarted`].
pub struct Command {
    command: String,
    workdir: Option<String>,
    env: BTreeMap<String, String>,

    stdin: Mutex<Option<InputStream>>,
    stdout: Mutex<Option<OutputStream>>,
    stderr: Mutex<Option<OutputStream>>,

    status: OnceLock<i32>,
    started: AtomicBool,
}

impl Command {
    /// Create a command from its text (program and arguments joined by spaces)
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            workdir: None,
            env: BTreeMap::new(),
            stdin: Mutex::new(None),
            stdout: Mutex::new(None),
            stderr: Mutex::new(None),
            status: OnceLock::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Set the working directory, an empty string leaves it unset
    #[must_use]
    pub fn with_workdir(mut self, workdir: impl Into<String>) -> Self {
        let workdir = workdir.into();
        self.workdir = (!workdir.is_empty()).then_some(workdir);
        self
    }

    /// Add an environment variable, replacing any previous value for `key`
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the stream read as stdin
    #[must_use]
    pub fn with_stdin(mut self, stdin: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.set_stdin(stdin);
        self
    }

    /// Set the stream receiving stdout
    #[must_use]
    pub fn with_stdout(mut self, stdout: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.set_stdout(stdout);
        self
    }

    /// Set the stream receiving stderr
    #[must_use]
    pub fn with_stderr(mut self, stderr: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.set_stderr(stderr);
        self
    }

    /// Replace the stdin source in place; see [`Command::with_stdin`]
    pub fn set_stdin(&mut self, stdin: impl AsyncRead + Send + Unpin + 'static) {
        *self.stdin.get_mut().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(stdin));
    }

    /// Replace the stdout sink in place; see [`Command::with_stdout`]
    pub fn set_stdout(&mut self, stdout: impl AsyncWrite + Send + Unpin + 'static) {
        *self.stdout.get_mut().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(stdout));
    }

    /// Replace the stderr sink in place; see [`Command::with_stderr`]
    pub fn set_stderr(&mut self, stderr: impl AsyncWrite + Send + Unpin + 'static) {
        *self.stderr.get_mut().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(stderr));
    }

    /// Command text
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Working directory, if any
    #[must_use]
    pub fn workdir(&self) -> Option<&str> {
        self.workdir.as_deref()
    }

    /// Environment variables, ordered by key
    #[must_use]
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Exit status of the attempt
    ///
    /// `None` until an execution has claimed and finished the command. After
    /// that it is `-1` when no exit code is known (validation failure,
    /// cancellation, transport error), otherwise the program's exit code.
    #[must_use]
    pub fn status(&self) -> Option<i32> {
        self.status.get().copied()
    }

    /// Whether an execution has claimed this command
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Atomically mark the command as started.
    ///
    /// Returns `true` for exactly one caller.
    pub(crate) fn claim(&self) -> bool {
        self.started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn set_status(&self, status: i32) {
        if self.status.set(status).is_err() {
            warn!(command = %self.command, status, "status already recorded, ignoring");
        }
    }

    /// Move the streams out of the command, defaulting unset ones to
    /// empty input and discarded output
    pub(crate) fn take_stdio(&self) -> Stdio {
        let null = Stdio::null();
        Stdio {
            stdin: take(&self.stdin).unwrap_or(null.stdin),
            stdout: take(&self.stdout).unwrap_or(null.stdout),
            stderr: take(&self.stderr).unwrap_or(null.stderr),
        }
    }

    /// Check that the command is safe to run
    ///
    /// # Errors
    /// Returns `ExecError::InvalidCommand` if the command text is empty, or if
    /// the command, working directory or environment contains a substring from
    /// [`COMMAND_DANGEROUS`], [`WORKDIR_DANGEROUS`] or [`ENV_DANGEROUS`].
    pub fn validate(&self) -> Result<(), ExecError> {
        if self.command.is_empty() {
            return Err(ExecError::InvalidCommand("command is empty".to_string()));
        }
        if let Some(workdir) = &self.workdir {
            if let Some(d) = find_dangerous(workdir, WORKDIR_DANGEROUS) {
                return Err(ExecError::InvalidCommand(format!(
                    "workdir ({workdir:?}) contains dangerous string: {d:?}"
                )));
            }
        }
        for (k, v) in &self.env {
            if let Some(d) = find_dangerous(k, ENV_DANGEROUS) {
                return Err(ExecError::InvalidCommand(format!(
                    "env key ({k:?}={v:?}) contains dangerous string: {d:?}"
                )));
            }
            if let Some(d) = find_dangerous(v, ENV_DANGEROUS) {
                return Err(ExecError::InvalidCommand(format!(
                    "env value ({k:?}={v:?}) contains dangerous string: {d:?}"
                )));
            }
        }
        if let Some(d) = find_dangerous(&self.command, COMMAND_DANGEROUS) {
            return Err(ExecError::InvalidCommand(format!(
                "command ({:?}) contains dangerous string: {d:?}",
                self.command
            )));
        }
        Ok(())
    }

    /// Render the command as one shell line:
    ///
    /// ```text
    /// cd <workdir> && export <key>=<value> && ... && <command>
    /// ```
    ///
    /// Values are inserted verbatim, call [`Command::validate`] first.
    #[must_use]
    pub fn shell_string(&self) -> String {
        let mut line = String::new();
        if let Some(workdir) = &self.workdir {
            line.push_str("cd ");
            line.push_str(workdir);
            line.push_str(" && ");
        }
        for (k, v) in &self.env {
            line.push_str(&format!("export {k}={v} && "));
        }
        line.push_str(&self.command);
        line
    }

    /// Split the command text into program and arguments, honoring shell
    /// quoting: `a b 'c d'` becomes `["a", "b", "c d"]`
    ///
    /// # Errors
    /// Returns `ExecError::ParseCommand` on unbalanced quotes or when nothing
    /// is left after splitting.
    pub fn argv(&self) -> Result<Vec<String>, ExecError> {
        let parts = shlex::split(&self.command).ok_or_else(|| {
            ExecError::ParseCommand(format!("unbalanced quoting in {:?}", self.command))
        })?;
        if parts.is_empty() {
            return Err(ExecError::ParseCommand("no program to run".to_string()));
        }
        Ok(parts)
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("command", &self.command)
            .field("workdir", &self.workdir)
            .field("env", &self.env)
            .field("status", &self.status())
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

fn find_dangerous<'a>(s: &str, dangerous: &[&'a str]) -> Option<&'a str> {
    dangerous.iter().copied().find(|d| s.contains(d))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_ok() {
        let cmd = Command::new("ls -la")
            .with_workdir("/tmp")
            .with_env("LANG", "C");
        assert!(cmd.validate().is_ok());
    }

    #[test]
    fn test_validate_empty() {
        let err = Command::new("").validate().unwrap_err();
        assert!(matches!(err, ExecError::InvalidCommand(_)));
    }

    #[test]
    fn test_validate_workdir_injection() {
        for workdir in ["/tmp; rm -rf /", "/tmp && id", "$(id)", "~/x", "/a b", "/tmp\nid"] {
            let cmd = Command::new("ls").with_workdir(workdir);
            assert!(
                matches!(cmd.validate(), Err(ExecError::InvalidCommand(_))),
                "workdir {workdir:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_validate_env_injection() {
        let cmd = Command::new("ls").with_env("A", "1|id");
        assert!(cmd.validate().is_err());

        let cmd = Command::new("ls").with_env("A;B", "1");
        assert!(cmd.validate().is_err());
    }

    #[test]
    fn test_validate_fork_bomb() {
        let cmd = Command::new("echo hi; :(){ :|:& };:");
        assert!(cmd.validate().is_err());

        // pipes and redirections are fine in the command text itself
        let cmd = Command::new("echo hi | tr a-z A-Z > /dev/null");
        assert!(cmd.validate().is_ok());
    }

    #[test]
    fn test_shell_string() {
        let cmd = Command::new("make test")
            .with_workdir("/src/app")
            .with_env("B", "2")
            .with_env("A", "1");
        assert_eq!(
            cmd.shell_string(),
            "cd /src/app && export A=1 && export B=2 && make test"
        );

        assert_eq!(Command::new("uptime").shell_string(), "uptime");
    }

    #[test]
    fn test_empty_workdir_is_unset() {
        let cmd = Command::new("pwd").with_workdir("").with_env("A", "1");
        assert_eq!(cmd.workdir(), None);
        assert_eq!(cmd.shell_string(), "export A=1 && pwd");
        assert!(cmd.validate().is_ok());
    }

    #[tokio::test]
    async fn test_empty_workdir_runs_in_current_dir() {
        use crate::{Executor, LocalExecutor};

        let executor = LocalExecutor::new();
        let cmd = Command::new("true").with_workdir("");
        let cancel = tokio_util::sync::CancellationToken::new();
        assert_eq!(executor.execute(&cancel, &cmd).await, Ok(()));
        assert_eq!(cmd.status(), Some(0));
    }

    #[tokio::test]
    async fn test_setters_replace_streams() {
        use crate::{Executor, ShellExecutor, SharedBuffer};

        let first = SharedBuffer::new();
        let second = SharedBuffer::new();
        let mut cmd = Command::new("cat").with_stdout(first.clone());
        cmd.set_stdout(second.clone());
        cmd.set_stdin(SharedBuffer::from_bytes("in"));

        let cancel = tokio_util::sync::CancellationToken::new();
        ShellExecutor::default().execute(&cancel, &cmd).await.unwrap();

        assert!(first.is_empty());
        assert_eq!(second.to_string_lossy(), "in");
    }

    #[test]
    fn test_argv_quoting() {
        let cmd = Command::new(r#"a b 'c d' "e f""#);
        assert_eq!(cmd.argv().unwrap(), vec!["a", "b", "c d", "e f"]);
    }

    #[test]
    fn test_argv_unterminated_quote() {
        let cmd = Command::new("echo 'oops");
        assert!(matches!(cmd.argv(), Err(ExecError::ParseCommand(_))));
    }

    #[test]
    fn test_claim_once() {
        let cmd = Command::new("true");
        assert!(!cmd.is_started());
        assert!(cmd.claim());
        assert!(!cmd.claim());
        assert!(cmd.is_started());
    }

    #[test]
    fn test_status_written_once() {
        let cmd = Command::new("true");
        assert_eq!(cmd.status(), None);
        cmd.set_status(0);
        cmd.set_status(5);
        assert_eq!(cmd.status(), Some(0));
    }
}
