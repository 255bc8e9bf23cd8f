//! Configuration loading and types

use std::path::{Path, PathBuf};

use eyre::WrapErr;
use rexec::ExecutorConfig;
use serde::{Deserialize, Serialize};

/// Top-level configuration for the rexec CLI
///
/// ```toml
/// log_level = "debug"
///
/// [executor]
/// kind = "shell"
/// shell_path = "/bin/bash"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error), `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Executor to run commands with, local by default
    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            executor: ExecutorConfig::default(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .wrap_err_with(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Load from `$REXEC_CONFIG` or the default paths, falling back to defaults
    ///
    /// # Errors
    /// Returns error if a config file exists but cannot be loaded
    pub fn load_default() -> eyre::Result<Self> {
        if let Ok(path) = std::env::var("REXEC_CONFIG") {
            return Self::load(Path::new(&path));
        }

        match Self::candidates().into_iter().find(|p| p.exists()) {
            Some(path) => Self::load(&path),
            None => Ok(Config::default()),
        }
    }

    /// Render as TOML with inline SSH secrets masked
    ///
    /// # Errors
    /// Returns error if the configuration cannot be serialized
    pub fn display_toml(&self) -> eyre::Result<String> {
        let shown = Config {
            log_level: self.log_level.clone(),
            executor: self.executor.redacted(),
        };
        toml::to_string_pretty(&shown).wrap_err("failed to serialize configuration")
    }

    fn candidates() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("rexec.toml")];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("rexec").join("rexec.toml"));
        }
        paths
    }
}
