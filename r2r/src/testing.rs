//! In-memory sessions, connectors and prompts for unit tests.

use std::collections::HashMap;
use std::io::{self, Cursor};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use secrecy::SecretString;
use tokio::io::AsyncWrite;

use crate::auth::{AuthMode, SecretPrompt};
use crate::error::{AuthError, Result, TransferError, TransportError};
use crate::transport::{Connector, RemoteSession, SshConfig};

/// Answers every prompt with the same secret and records the prompt texts.
pub(crate) struct ScriptedPrompt {
    secret: Option<String>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedPrompt {
    pub(crate) fn new(secret: &str) -> Self {
        Self {
            secret: Some(secret.to_string()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// A prompt whose terminal is gone.
    pub(crate) fn failing() -> Self {
        Self {
            secret: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl SecretPrompt for ScriptedPrompt {
    fn prompt_secret(&self, prompt: &str) -> io::Result<SecretString> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        match &self.secret {
            Some(secret) => Ok(SecretString::from(secret.clone())),
            None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "no terminal")),
        }
    }
}

/// A fake remote host with an in-memory filesystem.
#[derive(Clone)]
pub(crate) struct MockHost {
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    closes: Arc<AtomicUsize>,
    reachable: bool,
    accepts: Option<AuthMode>,
    fail_open_write: bool,
    fail_write_after: Option<usize>,
    fail_close: bool,
    hang_on_connect: bool,
    refuse_rename_over_existing: bool,
}

impl MockHost {
    pub(crate) fn new() -> Self {
        Self {
            files: Arc::new(Mutex::new(HashMap::new())),
            closes: Arc::new(AtomicUsize::new(0)),
            reachable: true,
            accepts: None,
            fail_open_write: false,
            fail_write_after: None,
            fail_close: false,
            hang_on_connect: false,
            refuse_rename_over_existing: false,
        }
    }

    pub(crate) fn with_file(self, path: &str, data: Vec<u8>) -> Self {
        self.files.lock().unwrap().insert(path.to_string(), data);
        self
    }

    pub(crate) fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    /// Only accept the given authentication mode.
    pub(crate) fn accepting(mut self, mode: AuthMode) -> Self {
        self.accepts = Some(mode);
        self
    }

    pub(crate) fn failing_open_write(mut self) -> Self {
        self.fail_open_write = true;
        self
    }

    /// Fail writes once the file holds `limit` bytes.
    pub(crate) fn failing_write_after(mut self, limit: usize) -> Self {
        self.fail_write_after = Some(limit);
        self
    }

    pub(crate) fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    /// Connection attempts never complete.
    pub(crate) fn hanging(mut self) -> Self {
        self.hang_on_connect = true;
        self
    }

    /// Rename fails when the target already exists, like many SFTP servers.
    pub(crate) fn refusing_rename_over_existing(mut self) -> Self {
        self.refuse_rename_over_existing = true;
        self
    }

    pub(crate) fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub(crate) fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.files.lock().unwrap().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Number of `close` calls across all sessions to this host.
    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// One recorded connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConnectRecord {
    pub host: String,
    pub username: String,
    pub port: u16,
    pub mode: AuthMode,
}

/// Connector over a fixed set of mock hosts, keyed by hostname.
#[derive(Default)]
pub(crate) struct MockConnector {
    hosts: HashMap<String, MockHost>,
    connects: Mutex<Vec<ConnectRecord>>,
}

impl MockConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_host(mut self, hostname: &str, host: MockHost) -> Self {
        self.hosts.insert(hostname.to_string(), host);
        self
    }

    pub(crate) fn connects(&self) -> Vec<ConnectRecord> {
        self.connects.lock().unwrap().clone()
    }
}

impl Connector for MockConnector {
    type Session = MockSession;

    async fn connect(&self, config: SshConfig) -> Result<MockSession> {
        self.connects.lock().unwrap().push(ConnectRecord {
            host: config.host.clone(),
            username: config.username.clone(),
            port: config.port,
            mode: config.auth.mode(),
        });

        let host = match self.hosts.get(&config.host) {
            Some(host) if host.reachable => host.clone(),
            _ => {
                return Err(TransportError::ConnectionFailed {
                    host: config.host,
                    port: config.port,
                    source: io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
                }
                .into());
            }
        };

        if host.hang_on_connect {
            std::future::pending::<()>().await;
        }

        if let Some(mode) = host.accepts {
            if mode != config.auth.mode() {
                return Err(AuthError::Rejected {
                    user: config.username,
                    host: config.host,
                }
                .into());
            }
        }

        Ok(MockSession {
            hostname: config.host,
            host,
            closed: false,
        })
    }
}

/// Session against a [`MockHost`].
pub(crate) struct MockSession {
    hostname: String,
    host: MockHost,
    closed: bool,
}

impl RemoteSession for MockSession {
    type Reader = Cursor<Vec<u8>>;
    type Writer = MockWriter;

    async fn stat_size(&mut self, path: &str) -> std::result::Result<u64, TransferError> {
        self.host
            .file(path)
            .map(|data| data.len() as u64)
            .ok_or_else(|| TransferError::Stat {
                path: path.to_string(),
                source: io::Error::from(io::ErrorKind::NotFound),
            })
    }

    async fn open_read(&mut self, path: &str) -> std::result::Result<Cursor<Vec<u8>>, TransferError> {
        self.host
            .file(path)
            .map(Cursor::new)
            .ok_or_else(|| TransferError::Open {
                path: path.to_string(),
                source: io::Error::from(io::ErrorKind::NotFound),
            })
    }

    async fn open_write(&mut self, path: &str) -> std::result::Result<MockWriter, TransferError> {
        if self.host.fail_open_write {
            return Err(TransferError::Open {
                path: path.to_string(),
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            });
        }
        self.host
            .files
            .lock()
            .unwrap()
            .insert(path.to_string(), Vec::new());
        Ok(MockWriter {
            files: self.host.files.clone(),
            path: path.to_string(),
            limit: self.host.fail_write_after,
        })
    }

    async fn rename(&mut self, from: &str, to: &str) -> std::result::Result<(), TransferError> {
        let mut files = self.host.files.lock().unwrap();
        if self.host.refuse_rename_over_existing && files.contains_key(to) {
            return Err(TransferError::Rename {
                from: from.to_string(),
                to: to.to_string(),
                source: io::Error::other("failure"),
            });
        }
        let data = files.remove(from).ok_or_else(|| TransferError::Rename {
            from: from.to_string(),
            to: to.to_string(),
            source: io::Error::from(io::ErrorKind::NotFound),
        })?;
        files.insert(to.to_string(), data);
        Ok(())
    }

    async fn remove(&mut self, path: &str) -> io::Result<()> {
        self.host
            .files
            .lock()
            .unwrap()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    async fn close(&mut self) -> Result<()> {
        self.host.closes.fetch_add(1, Ordering::SeqCst);
        let already_closed = std::mem::replace(&mut self.closed, true);
        if self.host.fail_close && !already_closed {
            return Err(TransportError::Sftp {
                host: self.hostname.clone(),
                message: "failed to close: channel reset".to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Appends to a file in a [`MockHost`], optionally failing past a size limit.
pub(crate) struct MockWriter {
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    path: String,
    limit: Option<usize>,
}

impl AsyncWrite for MockWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut files = self.files.lock().unwrap();
        let file = files.entry(self.path.clone()).or_default();
        let n = match self.limit {
            Some(limit) if file.len() >= limit => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::StorageFull,
                    "no space left on device",
                )));
            }
            Some(limit) => buf.len().min(limit - file.len()),
            None => buf.len(),
        };
        file.extend_from_slice(&buf[..n]);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
