//! Authenticated SFTP sessions and the seams the bridge drives them through.

use std::future::Future;
use std::io;

use log::{debug, warn};
use russh_sftp::client::SftpSession;
use russh_sftp::client::fs::File;
use tokio::io::{AsyncRead, AsyncWrite};

use super::config::SshConfig;
use super::ssh::SshTransport;
use crate::error::{Error, Result, TransferError, TransportError};

/// Remote file operations needed by a transfer.
///
/// `close` must be idempotent and safe on a session whose setup failed
/// halfway.
pub trait RemoteSession: Send {
    /// Channel for reading a remote file.
    type Reader: AsyncRead + Unpin + Send;

    /// Channel for writing a remote file.
    type Writer: AsyncWrite + Unpin + Send;

    /// Size of a remote file in bytes.
    fn stat_size(
        &mut self,
        path: &str,
    ) -> impl Future<Output = std::result::Result<u64, TransferError>> + Send;

    /// Open a remote file for reading.
    fn open_read(
        &mut self,
        path: &str,
    ) -> impl Future<Output = std::result::Result<Self::Reader, TransferError>> + Send;

    /// Create or truncate a remote file for writing.
    fn open_write(
        &mut self,
        path: &str,
    ) -> impl Future<Output = std::result::Result<Self::Writer, TransferError>> + Send;

    /// Rename a remote file.
    fn rename(
        &mut self,
        from: &str,
        to: &str,
    ) -> impl Future<Output = std::result::Result<(), TransferError>> + Send;

    /// Delete a remote file.
    fn remove(&mut self, path: &str) -> impl Future<Output = io::Result<()>> + Send;

    /// Release the session. Calling it again is a no-op.
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Whether `close` has run.
    fn is_closed(&self) -> bool;
}

/// Opens sessions from connection configs.
pub trait Connector: Send + Sync {
    type Session: RemoteSession;

    /// Connect, authenticate and return a ready session.
    fn connect(&self, config: SshConfig) -> impl Future<Output = Result<Self::Session>> + Send;
}

/// Production connector: SSH via russh, files via the SFTP subsystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshConnector;

impl Connector for SshConnector {
    type Session = SecureSession;

    async fn connect(&self, config: SshConfig) -> Result<SecureSession> {
        SecureSession::open(config).await
    }
}

/// One authenticated SFTP session to one remote host.
pub struct SecureSession {
    host: String,
    transport: Option<SshTransport>,
    sftp: Option<SftpSession>,
}

impl SecureSession {
    /// Connect, authenticate and start SFTP.
    ///
    /// If SFTP cannot be started the SSH connection is closed before the
    /// error is returned.
    pub async fn open(config: SshConfig) -> Result<Self> {
        let transport = SshTransport::connect(&config).await?;

        match transport.open_sftp().await {
            Ok(sftp) => Ok(Self {
                host: config.host,
                transport: Some(transport),
                sftp: Some(sftp),
            }),
            Err(e) => {
                if let Err(close_err) = transport.close().await {
                    debug!("closing {} after SFTP failure: {}", config.host, close_err);
                }
                Err(e)
            }
        }
    }

    /// The host this session is connected to.
    pub fn host(&self) -> &str {
        &self.host
    }

    fn sftp(&self) -> io::Result<&SftpSession> {
        self.sftp
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "session is closed"))
    }
}

impl RemoteSession for SecureSession {
    type Reader = File;
    type Writer = File;

    async fn stat_size(&mut self, path: &str) -> std::result::Result<u64, TransferError> {
        let stat_error = |source: io::Error| TransferError::Stat {
            path: path.to_string(),
            source,
        };
        let metadata = self
            .sftp()
            .map_err(stat_error)?
            .metadata(path)
            .await
            .map_err(|e| stat_error(io::Error::other(e)))?;
        Ok(metadata.len())
    }

    async fn open_read(&mut self, path: &str) -> std::result::Result<File, TransferError> {
        let open_error = |source: io::Error| TransferError::Open {
            path: path.to_string(),
            source,
        };
        self.sftp()
            .map_err(open_error)?
            .open(path)
            .await
            .map_err(|e| open_error(io::Error::other(e)))
    }

    async fn open_write(&mut self, path: &str) -> std::result::Result<File, TransferError> {
        let open_error = |source: io::Error| TransferError::Open {
            path: path.to_string(),
            source,
        };
        self.sftp()
            .map_err(open_error)?
            .create(path)
            .await
            .map_err(|e| open_error(io::Error::other(e)))
    }

    async fn rename(&mut self, from: &str, to: &str) -> std::result::Result<(), TransferError> {
        let rename_error = |source: io::Error| TransferError::Rename {
            from: from.to_string(),
            to: to.to_string(),
            source,
        };
        let sftp = self.sftp().map_err(rename_error)?;
        sftp.rename(from, to)
            .await
            .map_err(|e| rename_error(io::Error::other(e)))
    }

    async fn remove(&mut self, path: &str) -> io::Result<()> {
        self.sftp()?.remove_file(path).await.map_err(io::Error::other)
    }

    async fn close(&mut self) -> Result<()> {
        let mut first_error: Option<Error> = None;

        if let Some(sftp) = self.sftp.take() {
            if let Err(e) = sftp.close().await {
                first_error = Some(
                    TransportError::Sftp {
                        host: self.host.clone(),
                        message: format!("failed to close: {e}"),
                    }
                    .into(),
                );
            }
        }

        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn is_closed(&self) -> bool {
        self.transport.is_none()
    }
}

impl Drop for SecureSession {
    fn drop(&mut self) {
        if self.transport.is_some() {
            warn!("session to {} dropped without close", self.host);
        }
    }
}
