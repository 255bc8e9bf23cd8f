//! SSH transport using russh: dialing, authentication, sessions

use std::sync::Arc;

use async_trait::async_trait;
use russh::keys::ssh_key;
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, decode_secret_key, load_secret_key};
use russh::{Channel, ChannelMsg, Disconnect, Sig, client};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::config::{ConnectionTarget, SshAuth};
use crate::coordinator::Execution;
use crate::error::ExecError;
use crate::host_key::HostKeyVerifier;
use crate::io::Stdio;
use crate::transport::{Connection, Dialer, RemoteSession};

/// SSH client handler for russh, deciding host key trust
struct SshClientHandler {
    host: String,
    port: u16,
    verifier: HostKeyVerifier,
}

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(self.verifier.verify(&self.host, self.port, server_public_key))
    }
}

/// A credential ready to be offered to the server
enum Credential {
    Password(String),
    PublicKey(Arc<PrivateKey>),
}

struct PreparedAuth {
    credential: Credential,
    max_attempts: Option<u32>,
}

impl SshAuth {
    /// Load and parse the credential
    fn prepare(&self) -> Result<PreparedAuth, ExecError> {
        let credential = match (&self.password, &self.private_key, &self.private_key_path) {
            (Some(password), None, None) => {
                let password = password.trim();
                if password.is_empty() {
                    return Err(ExecError::ConfigError("password is empty".to_string()));
                }
                Credential::Password(password.to_string())
            }
            (None, Some(key), None) => {
                let key = key.trim();
                if key.is_empty() {
                    return Err(ExecError::SshKeyError("private key is empty".to_string()));
                }
                let key = decode_secret_key(key, None)
                    .map_err(|e| ExecError::SshKeyError(format!("unable to parse private key: {e}")))?;
                Credential::PublicKey(Arc::new(key))
            }
            (None, None, Some(path)) => {
                let key = load_secret_key(path, None).map_err(|e| {
                    ExecError::SshKeyError(format!(
                        "unable to load private key {}: {e}",
                        path.display()
                    ))
                })?;
                Credential::PublicKey(Arc::new(key))
            }
            _ => {
                return Err(self.check_exclusive().err().unwrap_or_else(|| {
                    ExecError::ConfigError("invalid authentication method".to_string())
                }));
            }
        };

        Ok(PreparedAuth {
            credential,
            max_attempts: self.max_attempts(),
        })
    }
}

/// Prepare every usable credential, in order
///
/// An entry whose key cannot be loaded or whose password is blank is logged
/// and skipped, so later entries still get their turn. Fails only when no
/// entry is usable, with the first entry's error.
fn prepare_all(auth: &[SshAuth]) -> Result<Vec<PreparedAuth>, ExecError> {
    let mut prepared = Vec::with_capacity(auth.len());
    let mut first_error = None;

    for (i, entry) in auth.iter().enumerate() {
        match entry.prepare() {
            Ok(credential) => prepared.push(credential),
            Err(e) => {
                warn!(index = i, error = %e, "skipping unusable authentication method");
                first_error.get_or_insert(e);
            }
        }
    }

    if prepared.is_empty() {
        return Err(first_error.unwrap_or_else(|| {
            ExecError::AuthenticationFailed("no authentication method configured".to_string())
        }));
    }
    Ok(prepared)
}

/// Dials a [`ConnectionTarget`] with russh
pub struct SshDialer {
    target: ConnectionTarget,
}

impl std::fmt::Debug for SshDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshDialer")
            .field("addr", &self.target.addr)
            .field("user", &self.target.user)
            .finish_non_exhaustive()
    }
}

impl SshDialer {
    /// Create a dialer
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` if the target is invalid
    pub fn new(target: ConnectionTarget) -> Result<Self, ExecError> {
        target.validate()?;
        Ok(Self { target })
    }

    /// Connection target
    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }
}

#[async_trait]
impl Dialer for SshDialer {
    #[instrument(skip(self), fields(addr = %self.target.addr, user = %self.target.user))]
    async fn dial(&self) -> Result<Arc<dyn Connection>, ExecError> {
        // everything that can fail without the network fails first
        let (host, port) = self.target.host_port()?;
        let credentials = prepare_all(&self.target.auth)?;
        let verifier = HostKeyVerifier::resolve(self.target.host_key_check.as_ref())?;

        info!(host = %host, port, "connecting to SSH");

        let config = Arc::new(client::Config::default());
        let handler = SshClientHandler {
            host: host.clone(),
            port,
            verifier,
        };

        let connect = client::connect(config, (host.as_str(), port), handler);
        let connected = match self.target.timeout() {
            Some(limit) => timeout(limit, connect).await.map_err(|_| {
                ExecError::ConnectionFailed(format!("timed out after {limit:?}"))
            })?,
            None => connect.await,
        };
        let mut handle = connected.map_err(|e| ExecError::ConnectionFailed(e.to_string()))?;

        authenticate(&mut handle, &self.target.user, &credentials).await?;

        let label = format!("{}@{host}:{port}", self.target.user);
        info!(connection = %label, "SSH connected and authenticated");

        Ok(Arc::new(SshConnection { handle, label }))
    }
}

/// Offer each credential in order, honoring its attempt limit
async fn authenticate(
    handle: &mut client::Handle<SshClientHandler>,
    user: &str,
    credentials: &[PreparedAuth],
) -> Result<(), ExecError> {
    for auth in credentials {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = match &auth.credential {
                Credential::Password(password) => {
                    handle.authenticate_password(user, password.clone()).await
                }
                Credential::PublicKey(key) => {
                    let hash_alg = handle
                        .best_supported_rsa_hash()
                        .await
                        .ok()
                        .flatten()
                        .flatten();
                    handle
                        .authenticate_publickey(
                            user,
                            PrivateKeyWithHashAlg::new(Arc::clone(key), hash_alg),
                        )
                        .await
                }
            }
            .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?;

            if result.success() {
                return Ok(());
            }

            debug!(attempt, "authentication attempt rejected");
            if auth.max_attempts.is_some_and(|max| attempt >= max) {
                break;
            }
        }
    }

    Err(ExecError::AuthenticationFailed(
        "all authentication methods were rejected".to_string(),
    ))
}

/// An authenticated russh connection
pub struct SshConnection {
    handle: client::Handle<SshClientHandler>,
    label: String,
}

impl std::fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnection")
            .field("label", &self.label)
            .field("closed", &self.handle.is_closed())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connection for SshConnection {
    async fn open_session(&self) -> Result<Box<dyn RemoteSession>, ExecError> {
        let channel = self.handle.channel_open_session().await?;
        debug!(connection = %self.label, "session opened");
        Ok(Box::new(SshSession {
            channel,
            stdio: None,
        }))
    }

    async fn probe(&self) -> Result<(), ExecError> {
        if self.handle.is_closed() {
            return Err(ExecError::ConnectionFailed(format!(
                "{}: connection closed",
                self.label
            )));
        }
        // resolves only once the server answers the keepalive request
        self.handle
            .send_ping()
            .await
            .map_err(|e| ExecError::ConnectionFailed(format!("{}: {e}", self.label)))
    }

    async fn close(&self) -> Result<(), ExecError> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await?;
        info!(connection = %self.label, "SSH disconnected");
        Ok(())
    }
}

/// One exec channel
pub struct SshSession {
    channel: Channel<client::Msg>,
    stdio: Option<Stdio>,
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn start(&mut self, cmdline: &str, stdio: Stdio) -> Result<(), ExecError> {
        self.channel.exec(true, cmdline).await?;
        self.stdio = Some(stdio);
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.channel.close().await {
            debug!(error = %e, "failed to close session");
        }
    }
}

/// What the remote side sent on a session
#[derive(Debug)]
enum SessionEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exited(Result<(), ExecError>),
    Closed,
    Ignored,
}

/// The half of a session channel the stream pump needs
#[async_trait]
trait SessionChannel: Send {
    async fn send(&mut self, data: &[u8]) -> Result<(), ExecError>;

    async fn send_eof(&mut self) -> Result<(), ExecError>;

    /// Next event, `None` once the channel is gone. Must be cancel safe.
    async fn next_event(&mut self) -> Option<SessionEvent>;
}

#[async_trait]
impl SessionChannel for Channel<client::Msg> {
    async fn send(&mut self, data: &[u8]) -> Result<(), ExecError> {
        Ok(self.data(data).await?)
    }

    async fn send_eof(&mut self) -> Result<(), ExecError> {
        Ok(self.eof().await?)
    }

    async fn next_event(&mut self) -> Option<SessionEvent> {
        let event = match self.wait().await? {
            ChannelMsg::Data { data } => SessionEvent::Stdout(data.to_vec()),
            ChannelMsg::ExtendedData { data, ext: 1 } => SessionEvent::Stderr(data.to_vec()),
            ChannelMsg::ExitStatus { exit_status } => {
                SessionEvent::Exited(match i32::try_from(exit_status) {
                    Ok(0) => Ok(()),
                    Ok(status) => Err(ExecError::Exit { status }),
                    Err(_) => Err(ExecError::IoError(format!(
                        "invalid exit status {exit_status}"
                    ))),
                })
            }
            ChannelMsg::ExitSignal { signal_name, .. } => {
                SessionEvent::Exited(Err(ExecError::Signaled(format!("{signal_name:?}"))))
            }
            ChannelMsg::Close => SessionEvent::Closed,
            _ => SessionEvent::Ignored,
        };
        Some(event)
    }
}

const STDIN_CHUNK: usize = 32 * 1024;

/// Forward stdin to the channel while copying its output back, until the
/// channel closes
async fn pump_session<C>(channel: &mut C, stdio: Stdio) -> Result<(), ExecError>
where
    C: SessionChannel + ?Sized,
{
    let Stdio {
        mut stdin,
        mut stdout,
        mut stderr,
    } = stdio;

    let mut result = Err(ExecError::IoError(
        "channel closed without exit status".to_string(),
    ));
    let mut buf = vec![0u8; STDIN_CHUNK];
    let mut stdin_open = true;

    loop {
        tokio::select! {
            read = stdin.read(&mut buf), if stdin_open => match read {
                Ok(0) => {
                    stdin_open = false;
                    channel.send_eof().await?;
                }
                Ok(n) => channel.send(&buf[..n]).await?,
                Err(e) => {
                    debug!(error = %e, "stdin pump stopped");
                    stdin_open = false;
                    channel.send_eof().await?;
                }
            },
            event = channel.next_event() => match event {
                Some(SessionEvent::Stdout(data)) => stdout
                    .write_all(&data)
                    .await
                    .map_err(|e| ExecError::IoError(e.to_string()))?,
                Some(SessionEvent::Stderr(data)) => stderr
                    .write_all(&data)
                    .await
                    .map_err(|e| ExecError::IoError(e.to_string()))?,
                Some(SessionEvent::Exited(exit)) => result = exit,
                Some(SessionEvent::Ignored) => {}
                Some(SessionEvent::Closed) | None => break,
            },
        }
    }

    if let Err(e) = stdout.flush().await {
        warn!(error = %e, "failed to flush stdout");
    }
    if let Err(e) = stderr.flush().await {
        warn!(error = %e, "failed to flush stderr");
    }

    result
}

#[async_trait]
impl Execution for SshSession {
    async fn wait(&mut self) -> Result<(), ExecError> {
        let Some(stdio) = self.stdio.take() else {
            return Err(ExecError::IoError("session not started".to_string()));
        };
        pump_session(&mut self.channel, stdio).await
    }

    async fn kill(&mut self) {
        if let Err(e) = self.channel.signal(Sig::KILL).await {
            debug!(error = %e, "failed to signal remote command");
        }
    }
}
