//! SSH command execution
//!
//! Both executors run [`Command::shell_string`] in a fresh session; they
//! differ in how long the connection lives.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, instrument};

use crate::command::Command;
use crate::config::{ConnectionTarget, KeepAliveSchedule};
use crate::coordinator::{coordinate, race};
use crate::dial::SshDialer;
use crate::error::ExecError;
use crate::io::Stdio;
use crate::keepalive::{ConnectionHealth, DEFAULT_CHECK_TIMEOUT, KeepAliveClient};
use crate::traits::Executor;
use crate::transport::{Connection, Dialer};

/// Dials, runs one command and disconnects, on every call
pub struct ImmediateSshExecutor {
    dialer: Arc<dyn Dialer>,
}

impl std::fmt::Debug for ImmediateSshExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImmediateSshExecutor").finish_non_exhaustive()
    }
}

impl ImmediateSshExecutor {
    /// Create an executor for `target`
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` if the target is invalid
    pub fn new(target: ConnectionTarget) -> Result<Self, ExecError> {
        Ok(Self::with_dialer(Arc::new(SshDialer::new(target)?)))
    }

    /// Create an executor over any [`Dialer`]
    pub fn with_dialer(dialer: Arc<dyn Dialer>) -> Self {
        Self { dialer }
    }
}

#[async_trait]
impl Executor for ImmediateSshExecutor {
    #[instrument(skip(self, cancel, cmd), fields(command = %cmd.command()), level = "debug")]
    async fn execute(&self, cancel: &CancellationToken, cmd: &Command) -> Result<(), ExecError> {
        coordinate(self.executor_type(), cancel, cmd, |stdio| async move {
            let conn = tokio::select! {
                conn = self.dialer.dial() => conn?,
                () = cancel.cancelled() => return Err(ExecError::Canceled),
            };

            let result = exec_on_connection(cancel, cmd, conn.as_ref(), stdio).await;

            if let Err(e) = conn.close().await {
                debug!(error = %e, "failed to close connection");
            }
            result
        })
        .await
    }

    fn executor_type(&self) -> &'static str {
        "immediate_ssh"
    }
}

/// Runs commands over one long-lived connection
///
/// Each command gets its own session, so concurrent calls multiplex over
/// the same connection. The connection is dialed on first use and kept
/// alive by a background task until [`Executor::close`].
#[derive(Debug)]
pub struct KeepAliveSshExecutor {
    client: KeepAliveClient,
}

impl KeepAliveSshExecutor {
    /// Create an executor for `target`
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` if the target is invalid
    pub fn new(target: ConnectionTarget) -> Result<Self, ExecError> {
        let span = info_span!("keep_alive_ssh", addr = %target.addr, user = %target.user);
        let schedule = target.keep_alive;
        let check_timeout = target.timeout().unwrap_or(DEFAULT_CHECK_TIMEOUT);
        let dialer = Arc::new(SshDialer::new(target)?);
        Ok(Self {
            client: KeepAliveClient::new(dialer, schedule)
                .with_check_timeout(check_timeout)
                .with_span(span),
        })
    }

    /// Create an executor over any [`Dialer`]
    pub fn with_dialer(dialer: Arc<dyn Dialer>, schedule: KeepAliveSchedule) -> Self {
        Self {
            client: KeepAliveClient::new(dialer, schedule),
        }
    }

    /// State of the managed connection
    pub async fn health(&self) -> ConnectionHealth {
        self.client.health().await
    }
}

#[async_trait]
impl Executor for KeepAliveSshExecutor {
    #[instrument(skip(self, cancel, cmd), fields(command = %cmd.command()), level = "debug")]
    async fn execute(&self, cancel: &CancellationToken, cmd: &Command) -> Result<(), ExecError> {
        coordinate(self.executor_type(), cancel, cmd, |stdio| async move {
            let conn = tokio::select! {
                conn = self.client.acquire() => conn?,
                () = cancel.cancelled() => return Err(ExecError::Canceled),
            };

            exec_on_connection(cancel, cmd, conn.as_ref(), stdio).await
        })
        .await
    }

    async fn close(&self) -> Result<(), ExecError> {
        self.client.close().await
    }

    fn executor_type(&self) -> &'static str {
        "keep_alive_ssh"
    }
}

/// Run `cmd` in a new session on `conn`, closing the session afterwards
async fn exec_on_connection(
    cancel: &CancellationToken,
    cmd: &Command,
    conn: &dyn Connection,
    stdio: Stdio,
) -> Result<(), ExecError> {
    let mut session = conn.open_session().await?;

    let line = cmd.shell_string();
    debug!(line = %line, "starting remote command");
    let result = match session.start(&line, stdio).await {
        Ok(()) => race(cancel, session.as_mut()).await,
        Err(e) => Err(e),
    };

    session.close().await;
    result
}
