//! Host key verification
//!
//! Turns a [`HostKeyCheckConfig`] into a [`HostKeyVerifier`] that decides
//! whether a server's public key is trusted. Resolution happens before any
//! network I/O, and every configuration problem is an error: nothing here
//! ever degrades to accepting unknown keys.

use std::path::{Path, PathBuf};

use russh::keys::ssh_key::PublicKey;
use tracing::{debug, warn};

use crate::config::HostKeyCheckConfig;
use crate::error::ExecError;

/// Which trust mechanism a config selects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept exactly one key
    Fixed(String),
    /// Accept keys listed for the host in these known_hosts files
    KnownHosts(Vec<PathBuf>),
    /// Accept everything
    InsecureIgnore,
    /// Use the system and user known_hosts files, deny all if there are none
    SystemDefault,
}

impl HostKeyPolicy {
    /// Pick the policy for an optional config
    ///
    /// No config and a default config both select `SystemDefault`.
    #[must_use]
    pub fn from_config(config: Option<&HostKeyCheckConfig>) -> Self {
        config.map_or(Self::SystemDefault, HostKeyCheckConfig::policy)
    }
}

impl HostKeyCheckConfig {
    /// Policy selected by this config, by priority
    #[must_use]
    pub fn policy(&self) -> HostKeyPolicy {
        if let Some(key) = &self.fixed_host_key {
            HostKeyPolicy::Fixed(key.clone())
        } else if !self.known_hosts_paths.is_empty() {
            HostKeyPolicy::KnownHosts(self.known_hosts_paths.clone())
        } else if self.insecure_ignore {
            HostKeyPolicy::InsecureIgnore
        } else {
            HostKeyPolicy::SystemDefault
        }
    }
}

/// Resolved host key decision
#[derive(Debug, Clone)]
pub enum HostKeyVerifier {
    /// Only this key is accepted
    Fixed(PublicKey),
    /// Keys are looked up in these (validated) known_hosts files
    KnownHosts(Vec<PathBuf>),
    /// Every key is accepted
    AcceptAny,
    /// Every key is rejected, with the reason
    DenyAll(String),
}

impl HostKeyVerifier {
    /// Resolve an optional config into a verifier
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` for an empty or unparseable fixed key,
    /// or a missing or malformed known_hosts file.
    pub fn resolve(config: Option<&HostKeyCheckConfig>) -> Result<Self, ExecError> {
        Self::from_policy(&HostKeyPolicy::from_config(config))
    }

    /// Resolve a policy into a verifier
    ///
    /// # Errors
    /// See [`HostKeyVerifier::resolve`].
    pub fn from_policy(policy: &HostKeyPolicy) -> Result<Self, ExecError> {
        match policy {
            HostKeyPolicy::Fixed(key) => parse_fixed_key(key).map(Self::Fixed),
            HostKeyPolicy::KnownHosts(paths) => {
                for path in paths {
                    validate_known_hosts(path)?;
                }
                Ok(Self::KnownHosts(paths.clone()))
            }
            HostKeyPolicy::InsecureIgnore => {
                warn!("host key checking disabled, accepting any host key");
                Ok(Self::AcceptAny)
            }
            HostKeyPolicy::SystemDefault => Self::from_candidates(&default_known_hosts_paths()),
        }
    }

    /// Use whichever of `candidates` exist, or deny all when none does
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` if an existing file is malformed.
    pub fn from_candidates(candidates: &[PathBuf]) -> Result<Self, ExecError> {
        let existing: Vec<PathBuf> = candidates.iter().filter(|p| p.exists()).cloned().collect();
        if existing.is_empty() {
            warn!(
                ?candidates,
                "no known_hosts file found, all host keys will be rejected"
            );
            return Ok(Self::DenyAll(
                "no known_hosts file found at ~/.ssh/known_hosts or /etc/ssh/ssh_known_hosts"
                    .to_string(),
            ));
        }
        Self::from_policy(&HostKeyPolicy::KnownHosts(existing))
    }

    /// Decide whether `key`, presented by `host:port`, is trusted
    #[must_use]
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> bool {
        match self {
            Self::Fixed(expected) => {
                let ok = expected.key_data() == key.key_data();
                if !ok {
                    warn!(host, port, "host key does not match the configured key");
                }
                ok
            }
            Self::KnownHosts(paths) => verify_known_hosts(paths, host, port, key),
            Self::AcceptAny => true,
            Self::DenyAll(reason) => {
                warn!(host, port, reason = %reason, "host key rejected");
                false
            }
        }
    }
}

fn parse_fixed_key(key: &str) -> Result<PublicKey, ExecError> {
    let key = key.trim();
    if key.is_empty() {
        return Err(ExecError::ConfigError("fixed host key is empty".to_string()));
    }
    PublicKey::from_openssh(key)
        .map_err(|e| ExecError::ConfigError(format!("invalid fixed host key: {e}")))
}

/// Make sure `path` is readable and every entry carries a parseable key
fn validate_known_hosts(path: &Path) -> Result<(), ExecError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ExecError::ConfigError(format!("cannot read known_hosts {}: {e}", path.display()))
    })?;

    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields: Vec<&str> = line.split_whitespace().collect();
        if fields.first().is_some_and(|f| f.starts_with('@')) {
            fields.remove(0);
        }

        let malformed = |reason: &str| {
            ExecError::ConfigError(format!(
                "malformed known_hosts {} line {}: {reason}",
                path.display(),
                idx + 1
            ))
        };

        let [_hosts, key_type, key_b64, ..] = fields.as_slice() else {
            return Err(malformed("expected hosts, key type and key"));
        };
        PublicKey::from_openssh(&format!("{key_type} {key_b64}"))
            .map_err(|e| malformed(&e.to_string()))?;
    }

    debug!(path = %path.display(), "known_hosts file validated");
    Ok(())
}

fn verify_known_hosts(paths: &[PathBuf], host: &str, port: u16, key: &PublicKey) -> bool {
    for path in paths {
        match russh::keys::check_known_hosts_path(host, port, key, path) {
            Ok(true) => {
                debug!(host, port, path = %path.display(), "host key found in known_hosts");
                return true;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(host, port, path = %path.display(), error = %e, "host key rejected by known_hosts");
                return false;
            }
        }
    }
    warn!(host, port, "host key not found in any known_hosts file");
    false
}

/// Well-known known_hosts locations, existing or not
fn default_known_hosts_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if cfg!(unix) {
        paths.push(PathBuf::from("/etc/ssh/ssh_known_hosts"));
        paths.push(PathBuf::from("/etc/ssh/ssh_known_hosts2"));
    }

    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".ssh").join("known_hosts"));
        paths.push(home.join(".ssh").join("known_hosts2"));
    }

    paths
}
