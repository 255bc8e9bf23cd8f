//! Standard stream plumbing for commands

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::command::Command;

/// Readable stream fed to a command's stdin
pub type InputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Writable stream receiving a command's stdout or stderr
pub type OutputStream = Box<dyn AsyncWrite + Send + Unpin>;

/// The three byte streams handed to one execution
pub struct Stdio {
    pub stdin: InputStream,
    pub stdout: OutputStream,
    pub stderr: OutputStream,
}

impl Stdio {
    /// Empty stdin, discarded output
    #[must_use]
    pub fn null() -> Self {
        Self {
            stdin: Box::new(tokio::io::empty()),
            stdout: Box::new(tokio::io::sink()),
            stderr: Box::new(tokio::io::sink()),
        }
    }
}

impl std::fmt::Debug for Stdio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stdio").finish_non_exhaustive()
    }
}

/// Cloneable in-memory byte buffer
///
/// Writing appends to the end, reading drains from the front. Every clone
/// shares the same bytes, so one handle can be attached to a command while
/// another is kept to inspect the output afterwards.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    /// Create an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a buffer holding `data`
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(data.into())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append bytes
    pub fn extend(&self, data: &[u8]) {
        self.lock().extend_from_slice(data);
    }

    /// Copy of the current contents
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.lock().clone()
    }

    /// Current contents decoded lossily as UTF-8
    #[must_use]
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.lock()).to_string()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl AsyncWrite for SharedBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.extend(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for SharedBuffer {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut data = self.lock();
        let n = data.len().min(buf.remaining());
        buf.put_slice(&data[..n]);
        data.drain(..n);
        Poll::Ready(Ok(()))
    }
}

/// Bundle of in-memory buffers used as a command's stdin, stdout and stderr
#[derive(Debug, Clone, Default)]
pub struct ManagedIo {
    pub stdin: SharedBuffer,
    pub stdout: SharedBuffer,
    pub stderr: SharedBuffer,
}

impl ManagedIo {
    /// Create a bundle of empty buffers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the command's streams with this bundle's buffers
    ///
    /// Bytes written to `self.stdin` before execution are fed to the command;
    /// `self.stdout` and `self.stderr` collect its output.
    pub fn hijack(&self, cmd: &mut Command) {
        cmd.set_stdin(self.stdin.clone());
        cmd.set_stdout(self.stdout.clone());
        cmd.set_stderr(self.stderr.clone());
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn test_shared_buffer_clones_share_bytes() {
        let buf = SharedBuffer::new();
        let mut writer = buf.clone();
        writer.write_all(b"hello ").await.unwrap();
        writer.write_all(b"world").await.unwrap();

        assert_eq!(buf.to_string_lossy(), "hello world");
        assert_eq!(buf.len(), 11);
    }

    #[tokio::test]
    async fn test_shared_buffer_read_drains() {
        let mut buf = SharedBuffer::from_bytes("abc");
        let mut out = String::new();
        buf.read_to_string(&mut out).await.unwrap();

        assert_eq!(out, "abc");
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_hijack_attaches_buffers() {
        let managed = ManagedIo::new();
        let mut cmd = Command::new("cat");
        managed.hijack(&mut cmd);
        managed.stdin.extend(b"piped");

        let mut stdio = cmd.take_stdio();
        let mut input = String::new();
        stdio.stdin.read_to_string(&mut input).await.unwrap();
        stdio.stdout.write_all(b"out").await.unwrap();

        assert_eq!(input, "piped");
        assert_eq!(managed.stdout.to_string_lossy(), "out");
        assert!(managed.stderr.is_empty());
    }
}
