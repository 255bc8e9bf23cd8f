//! Long-lived SSH connection with background keep-alive and redial
//!
//! [`KeepAliveClient::acquire`] hands out the current connection, dialing
//! synchronously when there is none. After the first successful dial a
//! background task wakes on [`KeepAliveSchedule`], redials a lost connection
//! and probes a live one. A check that gets no answer within the
//! check timeout counts as a failure. Failures in that task are only logged; the
//! next `acquire` simply dials again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span, instrument, warn};

use crate::config::KeepAliveSchedule;
use crate::error::ExecError;
use crate::transport::{Connection, Dialer};

/// How long a liveness check may wait for the server's reply
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(15);

/// Snapshot of the managed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHealth {
    /// Whether a connection is currently held
    pub connected: bool,
    /// Failed probe/redial cycles since the last success
    pub consecutive_failures: i64,
}

#[derive(Default)]
struct State {
    conn: Option<Arc<dyn Connection>>,
    retries: i64,
    closed: bool,
    probe: Option<JoinHandle<()>>,
}

/// Owns one connection and keeps it alive
pub struct KeepAliveClient {
    dialer: Arc<dyn Dialer>,
    schedule: KeepAliveSchedule,
    check_timeout: Duration,
    state: Arc<Mutex<State>>,
    stop: CancellationToken,
    span: Span,
}

impl std::fmt::Debug for KeepAliveClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAliveClient")
            .field("schedule", &self.schedule)
            .field("check_timeout", &self.check_timeout)
            .field("stopped", &self.stop.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl KeepAliveClient {
    /// Create a client; nothing is dialed until the first [`acquire`](Self::acquire)
    pub fn new(dialer: Arc<dyn Dialer>, schedule: KeepAliveSchedule) -> Self {
        Self {
            dialer,
            schedule,
            check_timeout: DEFAULT_CHECK_TIMEOUT,
            state: Arc::new(Mutex::new(State::default())),
            stop: CancellationToken::new(),
            span: info_span!("keep_alive"),
        }
    }

    /// Bound each liveness check; a zero duration is ignored
    #[must_use]
    pub fn with_check_timeout(mut self, limit: Duration) -> Self {
        if !limit.is_zero() {
            self.check_timeout = limit;
        }
        self
    }

    /// Attach the client's logs to `span`
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Get a live connection, dialing if needed
    ///
    /// # Errors
    /// Returns `ExecError::Closed` after [`close`](Self::close), or the dial error
    pub async fn acquire(&self) -> Result<Arc<dyn Connection>, ExecError> {
        let mut state = self.state.lock().await;

        if state.closed {
            return Err(ExecError::Closed);
        }

        if let Some(conn) = &state.conn {
            return Ok(Arc::clone(conn));
        }

        debug!(parent: &self.span, "dialing");
        let conn = match self.dialer.dial().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(parent: &self.span, error = %e, "dial failed");
                return Err(e);
            }
        };
        info!(parent: &self.span, "dial succeeded");

        state.conn = Some(Arc::clone(&conn));
        state.retries = 0;

        if state.probe.is_none() {
            let task = probe_loop(
                Arc::clone(&self.dialer),
                self.schedule,
                self.check_timeout,
                Arc::clone(&self.state),
                self.stop.clone(),
            );
            state.probe = Some(tokio::spawn(task.instrument(self.span.clone())));
            debug!(parent: &self.span, "keep-alive loop started");
        }

        Ok(conn)
    }

    /// Current connection state
    pub async fn health(&self) -> ConnectionHealth {
        let state = self.state.lock().await;
        ConnectionHealth {
            connected: state.conn.is_some(),
            consecutive_failures: state.retries,
        }
    }

    /// Stop the keep-alive loop and close the connection
    ///
    /// # Errors
    /// Returns `ExecError::AlreadyClosed` on every call after the first, or the
    /// error from closing the connection
    #[instrument(skip(self), parent = &self.span)]
    pub async fn close(&self) -> Result<(), ExecError> {
        let probe = {
            let mut state = self.state.lock().await;
            if state.closed {
                warn!("already closed");
                return Err(ExecError::AlreadyClosed);
            }
            state.closed = true;
            state.probe.take()
        };

        // the loop takes the lock, so it must not be held while joining
        self.stop.cancel();
        if let Some(probe) = probe {
            if let Err(e) = probe.await {
                warn!(error = %e, "keep-alive loop ended abnormally");
            }
        }

        let conn = self.state.lock().await.conn.take();
        let result = match conn {
            Some(conn) => conn.close().await,
            None => Ok(()),
        };
        info!(ok = result.is_ok(), "closed");
        result
    }
}

impl Drop for KeepAliveClient {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn probe_loop(
    dialer: Arc<dyn Dialer>,
    schedule: KeepAliveSchedule,
    check_timeout: Duration,
    state: Arc<Mutex<State>>,
    stop: CancellationToken,
) {
    loop {
        let retries = state.lock().await.retries;
        let wait = schedule.interval(retries);

        tokio::select! {
            () = stop.cancelled() => break,
            () = tokio::time::sleep(wait) => {}
        }

        tokio::select! {
            () = stop.cancelled() => break,
            () = tick(dialer.as_ref(), &state, check_timeout) => {}
        }
    }
    debug!("keep-alive loop stopped");
}

/// One cycle: redial if disconnected, then probe
async fn tick(dialer: &dyn Dialer, state: &Mutex<State>, check_timeout: Duration) {
    let current = state.lock().await.conn.clone();

    let conn = match current {
        Some(conn) => conn,
        None => {
            debug!("redialing");
            match dialer.dial().await {
                Ok(conn) => {
                    let mut guard = state.lock().await;
                    if guard.closed || guard.conn.is_some() {
                        drop(guard);
                        discard(conn).await;
                        return;
                    }
                    guard.conn = Some(Arc::clone(&conn));
                    drop(guard);
                    info!("redial succeeded");
                    conn
                }
                Err(e) => {
                    warn!(error = %e, "redial failed");
                    failed(state).await;
                    return;
                }
            }
        }
    };

    let checked = tokio::time::timeout(check_timeout, conn.probe())
        .await
        .unwrap_or_else(|_| {
            Err(ExecError::ConnectionFailed(format!(
                "no keep-alive reply within {check_timeout:?}"
            )))
        });

    match checked {
        Ok(()) => {
            let mut guard = state.lock().await;
            if guard.retries != 0 {
                debug!(retries = guard.retries, "keep-alive recovered");
            }
            guard.retries = 0;
        }
        Err(e) => {
            warn!(error = %e, "keep-alive failed, dropping connection");
            {
                let mut guard = state.lock().await;
                if guard
                    .conn
                    .as_ref()
                    .is_some_and(|held| std::ptr::addr_eq(Arc::as_ptr(held), Arc::as_ptr(&conn)))
                {
                    guard.conn = None;
                }
            }
            failed(state).await;
            discard(conn).await;
        }
    }
}

async fn failed(state: &Mutex<State>) {
    let mut guard = state.lock().await;
    guard.retries = guard.retries.saturating_add(1);
    debug!(retries = guard.retries, "keep-alive cycle failed");
}

async fn discard(conn: Arc<dyn Connection>) {
    if let Err(e) = conn.close().await {
        debug!(error = %e, "failed to close discarded connection");
    }
}
