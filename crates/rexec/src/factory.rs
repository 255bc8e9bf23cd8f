//! Build any executor from configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::config::ConnectionTarget;
use crate::error::ExecError;
use crate::local::{LocalExecutor, ShellExecutor};
use crate::ssh::{ImmediateSshExecutor, KeepAliveSshExecutor};
use crate::traits::Executor;

/// Which executor to use, and its settings
///
/// ```toml
/// kind = "keep_alive_ssh"
///
/// [target]
/// addr = "10.0.0.2:22"
/// user = "deploy"
/// auth = [{ private_key_path = "/home/deploy/.ssh/id_ed25519" }]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutorConfig {
    /// [`LocalExecutor`]
    #[default]
    Local,
    /// [`ShellExecutor`]
    Shell {
        #[serde(default = "default_shell_path")]
        shell_path: PathBuf,
        #[serde(default = "default_shell_args")]
        shell_args: Vec<String>,
    },
    /// [`ImmediateSshExecutor`]
    ImmediateSsh { target: ConnectionTarget },
    /// [`KeepAliveSshExecutor`]
    KeepAliveSsh { target: ConnectionTarget },
}

fn default_shell_path() -> PathBuf {
    PathBuf::from("/bin/sh")
}

fn default_shell_args() -> Vec<String> {
    vec!["-c".to_string()]
}

impl ExecutorConfig {
    /// Name of the configured executor kind
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Shell { .. } => "shell",
            Self::ImmediateSsh { .. } => "immediate_ssh",
            Self::KeepAliveSsh { .. } => "keep_alive_ssh",
        }
    }

    /// Copy with SSH secrets masked, for display
    #[must_use]
    pub fn redacted(&self) -> Self {
        match self {
            Self::ImmediateSsh { target } => Self::ImmediateSsh {
                target: target.redacted(),
            },
            Self::KeepAliveSsh { target } => Self::KeepAliveSsh {
                target: target.redacted(),
            },
            other => other.clone(),
        }
    }

    /// Create the configured executor
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` if the settings are invalid
    pub fn build(&self) -> Result<Box<dyn Executor>, ExecError> {
        let executor: Result<Box<dyn Executor>, ExecError> = match self {
            Self::Local => Ok(Box::new(LocalExecutor::new())),
            Self::Shell {
                shell_path,
                shell_args,
            } => ShellExecutor::new(shell_path.clone(), shell_args.clone())
                .map(|e| Box::new(e) as Box<dyn Executor>),
            Self::ImmediateSsh { target } => ImmediateSshExecutor::new(target.clone())
                .map(|e| Box::new(e) as Box<dyn Executor>),
            Self::KeepAliveSsh { target } => KeepAliveSshExecutor::new(target.clone())
                .map(|e| Box::new(e) as Box<dyn Executor>),
        };

        match &executor {
            Ok(_) => info!(kind = self.kind(), "executor created"),
            Err(e) => error!(kind = self.kind(), error = %e, "bad executor configuration"),
        }
        executor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Wrapper {
        executor: ExecutorConfig,
    }

    fn parse(toml_str: &str) -> ExecutorConfig {
        toml::from_str::<Wrapper>(toml_str).unwrap().executor
    }

    #[test]
    fn test_parse_local() {
        let config = parse(
            r#"
            [executor]
            kind = "local"
            "#,
        );
        assert_eq!(config.kind(), "local");
        assert_eq!(config.build().unwrap().executor_type(), "local");
    }

    #[test]
    fn test_parse_shell_defaults() {
        let config = parse(
            r#"
            [executor]
            kind = "shell"
            "#,
        );
        match &config {
            ExecutorConfig::Shell {
                shell_path,
                shell_args,
            } => {
                assert_eq!(shell_path, &PathBuf::from("/bin/sh"));
                assert_eq!(shell_args, &vec!["-c".to_string()]);
            }
            other => panic!("unexpected config: {other:?}"),
        }
        assert_eq!(config.build().unwrap().executor_type(), "shell");
    }

    #[test]
    fn test_parse_keep_alive_ssh() {
        let config = parse(
            r#"
            [executor]
            kind = "keep_alive_ssh"

            [executor.target]
            addr = "10.0.0.2"
            user = "deploy"
            auth = [{ password = "secret", retries = 3 }]
            keep_alive = { interval_secs = 5 }
            "#,
        );
        let ExecutorConfig::KeepAliveSsh { target } = &config else {
            panic!("unexpected config: {config:?}");
        };
        assert_eq!(target.host_port().unwrap(), ("10.0.0.2".to_string(), 22));
        assert_eq!(target.keep_alive.interval_secs, 5);
        assert_eq!(target.keep_alive.increment_secs, 10);
        assert_eq!(target.auth[0].max_attempts(), Some(3));
    }

    #[tokio::test]
    async fn test_build_ssh_kinds() {
        let target = ConnectionTarget::new("127.0.0.1:2222", "root");

        let immediate = ExecutorConfig::ImmediateSsh {
            target: target.clone(),
        }
        .build()
        .unwrap();
        assert_eq!(immediate.executor_type(), "immediate_ssh");

        let keep_alive = ExecutorConfig::KeepAliveSsh { target }.build().unwrap();
        assert_eq!(keep_alive.executor_type(), "keep_alive_ssh");
        keep_alive.close().await.unwrap();
    }

    #[test]
    fn test_bad_config_rejected() {
        let shell = ExecutorConfig::Shell {
            shell_path: PathBuf::new(),
            shell_args: vec![],
        };
        assert!(matches!(shell.build(), Err(ExecError::ConfigError(_))));

        let ssh = ExecutorConfig::ImmediateSsh {
            target: ConnectionTarget::new("", "root"),
        };
        assert!(matches!(ssh.build(), Err(ExecError::ConfigError(_))));
    }

    #[test]
    fn test_redacted_config_hides_password() {
        let config = parse(
            r#"
            [executor]
            kind = "immediate_ssh"

            [executor.target]
            addr = "10.0.0.2"
            user = "deploy"
            auth = [{ password = "s3cret" }]
            "#,
        );

        let shown = toml::to_string(&config.redacted()).unwrap();
        assert!(!shown.contains("s3cret"));
        assert!(shown.contains("<redacted>"));
        assert!(shown.contains("10.0.0.2"));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let result = toml::from_str::<Wrapper>(
            r#"
            [executor]
            kind = "telnet"
            "#,
        );
        assert!(result.is_err());
    }
}
