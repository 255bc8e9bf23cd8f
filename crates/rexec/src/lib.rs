//! rexec: Command execution on local and remote hosts
//!
//! One [`Executor`] contract with four backends: a direct process, a shell,
//! one SSH connection per command, and a kept-alive SSH connection shared by
//! many commands. Every backend claims a [`Command`] exactly once and records
//! the same status for the same outcome.

pub mod command;
pub mod config;
pub mod coordinator;
pub mod dial;
pub mod error;
pub mod factory;
pub mod host_key;
pub mod io;
pub mod keepalive;
pub mod local;
pub mod result;
pub mod ssh;
pub mod traits;
pub mod transport;

pub use command::{Command, STATUS_UNKNOWN};
pub use config::{ConnectionTarget, HostKeyCheckConfig, KeepAliveSchedule, SshAuth};
pub use coordinator::{Execution, derive_status};
pub use dial::{SshConnection, SshDialer, SshSession};
pub use error::ExecError;
pub use factory::ExecutorConfig;
pub use host_key::{HostKeyPolicy, HostKeyVerifier};
pub use io::{ManagedIo, SharedBuffer, Stdio};
pub use keepalive::{ConnectionHealth, DEFAULT_CHECK_TIMEOUT, KeepAliveClient};
pub use local::{LocalExecutor, ShellExecutor};
pub use result::CommandResult;
pub use ssh::{ImmediateSshExecutor, KeepAliveSshExecutor};
pub use traits::Executor;
pub use transport::{Connection, Dialer, RemoteSession};
