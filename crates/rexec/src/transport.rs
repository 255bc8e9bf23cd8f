//! Seams between the executors and the remote shell transport
//!
//! The SSH executors only talk to these traits. [`crate::dial`] provides the
//! russh implementation; tests plug in their own.

use std::sync::Arc;

use async_trait::async_trait;

use crate::coordinator::Execution;
use crate::error::ExecError;
use crate::io::Stdio;

/// Makes one authenticated connection attempt
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> Result<Arc<dyn Connection>, ExecError>;
}

/// An authenticated connection multiplexing independent sessions
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a fresh session for one command
    async fn open_session(&self) -> Result<Box<dyn RemoteSession>, ExecError>;

    /// Send a no-op request and wait for the peer's reply
    ///
    /// Must not succeed before the remote side has answered.
    async fn probe(&self) -> Result<(), ExecError>;

    /// Tear the connection down
    async fn close(&self) -> Result<(), ExecError>;
}

/// One command's channel on a [`Connection`]
///
/// `start` runs the command line; the [`Execution`] methods then wait for
/// it or signal it.
#[async_trait]
pub trait RemoteSession: Execution {
    /// Start `cmdline`, wiring its streams to `stdio`
    async fn start(&mut self, cmdline: &str, stdio: Stdio) -> Result<(), ExecError>;

    /// Close the session; the connection stays open
    async fn close(&mut self);
}
