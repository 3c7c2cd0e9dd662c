//! SSH transport implementation using russh.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use russh::client::{self, Handle};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey, load_secret_key};
use russh_sftp::client::SftpSession;
use secrecy::ExposeSecret;

use super::config::{HostKeyVerification, SshConfig};
use crate::auth::AuthDecision;
use crate::error::{AuthError, Result, TransportError};

/// Interval between keepalive requests on an open session.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Unanswered keepalives before the session is considered dead.
const KEEPALIVE_MAX: usize = 3;

/// russh client settings.
///
/// A session may sit idle on one side while the other side is slow, so
/// liveness is checked with keepalives instead of an inactivity timeout.
fn client_config() -> client::Config {
    client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(KEEPALIVE_INTERVAL),
        keepalive_max: KEEPALIVE_MAX,
        ..Default::default()
    }
}

/// SSH transport wrapping a russh client.
pub struct SshTransport {
    /// The russh session handle.
    session: Handle<SshHandler>,

    /// Host this transport is connected to.
    host: String,
}

impl SshTransport {
    /// Connect to the SSH server and authenticate.
    ///
    /// The whole handshake is bounded by `config.timeout`.
    pub async fn connect(config: &SshConfig) -> Result<Self> {
        let ssh_config = Arc::new(client_config());

        let host_key_error: Arc<Mutex<Option<TransportError>>> = Arc::new(Mutex::new(None));

        let handler = SshHandler {
            host: config.host.clone(),
            port: config.port,
            host_key_verification: config.host_key_verification,
            known_hosts_path: config.known_hosts_path.clone(),
            host_key_error: host_key_error.clone(),
        };

        debug!("connecting to {}", config.socket_addr());

        let mut session = tokio::time::timeout(
            config.timeout,
            client::connect(ssh_config, (config.host.as_str(), config.port), handler),
        )
        .await
        .map_err(|_| TransportError::Timeout {
            host: config.host.clone(),
            port: config.port,
            timeout: config.timeout,
        })?
        .map_err(|e| {
            // Prefer the detailed host key error stored by the handler over
            // russh's generic rejection.
            let stored = host_key_error.lock().ok().and_then(|mut slot| slot.take());
            stored.unwrap_or_else(|| classify(config, e))
        })?;

        let authenticated =
            match tokio::time::timeout(config.timeout, Self::authenticate(&mut session, config))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout {
                    host: config.host.clone(),
                    port: config.port,
                    timeout: config.timeout,
                }
                .into()),
            };

        if let Err(e) = authenticated {
            if let Err(close_err) = session
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await
            {
                debug!("disconnect after failed auth: {}", close_err);
            }
            return Err(e);
        }

        debug!("authenticated as {}", config.target());

        Ok(Self {
            session,
            host: config.host.clone(),
        })
    }

    /// Open a session channel and start the SFTP subsystem on it.
    pub async fn open_sftp(&self) -> Result<SftpSession> {
        let sftp_error = |message: String| TransportError::Sftp {
            host: self.host.clone(),
            message,
        };

        let channel = self
            .session
            .channel_open_session()
            .await
            .map_err(|e| sftp_error(format!("failed to open channel: {e}")))?;

        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| sftp_error(format!("failed to request subsystem: {e}")))?;

        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| sftp_error(format!("failed to initialize: {e}")))?;

        Ok(sftp)
    }

    /// Authenticate with the server.
    async fn authenticate(session: &mut Handle<SshHandler>, config: &SshConfig) -> Result<()> {
        let ssh_error = |source: russh::Error| TransportError::Ssh {
            host: config.host.clone(),
            source,
        };

        let success = match &config.auth {
            AuthDecision::Password(password) => session
                .authenticate_password(&config.username, password.expose_secret())
                .await
                .map_err(ssh_error)?
                .success(),
            AuthDecision::IdentityFile { path, passphrase } => {
                let key = load_secret_key(path, passphrase.as_ref().map(|p| p.expose_secret()))
                    .map_err(|e| AuthError::Key {
                        path: path.clone(),
                        message: e.to_string(),
                    })?;

                // Get the best RSA hash algorithm supported by the server
                let hash_alg = session
                    .best_supported_rsa_hash()
                    .await
                    .map_err(ssh_error)?
                    .flatten();

                session
                    .authenticate_publickey(
                        &config.username,
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                    )
                    .await
                    .map_err(ssh_error)?
                    .success()
            }
        };

        if !success {
            return Err(AuthError::Rejected {
                user: config.username.clone(),
                host: config.host.clone(),
            }
            .into());
        }

        Ok(())
    }

    /// Close the connection.
    pub async fn close(self) -> Result<()> {
        self.session
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
            .map_err(|source| TransportError::Ssh {
                host: self.host.clone(),
                source,
            })?;
        Ok(())
    }
}

/// Split russh connect failures into socket-level and protocol-level errors.
fn classify(config: &SshConfig, error: russh::Error) -> TransportError {
    match error {
        russh::Error::IO(source) => TransportError::ConnectionFailed {
            host: config.host.clone(),
            port: config.port,
            source,
        },
        source => TransportError::Ssh {
            host: config.host.clone(),
            source,
        },
    }
}

/// SSH client handler for russh.
struct SshHandler {
    host: String,
    port: u16,
    host_key_verification: HostKeyVerification,
    known_hosts_path: Option<PathBuf>,
    /// Stores a detailed host-key error so connect() can surface it
    /// instead of the generic russh::Error::UnknownKey.
    host_key_error: Arc<Mutex<Option<TransportError>>>,
}

impl SshHandler {
    /// Check the host key against known_hosts.
    ///
    /// Returns `Ok(true)` if matched, `Ok(false)` if host not found,
    /// `Err(TransportError::HostKeyChanged)` if key changed.
    fn check_known_hosts(&self, pubkey: &PublicKey) -> std::result::Result<bool, TransportError> {
        let result = if let Some(ref path) = self.known_hosts_path {
            russh::keys::check_known_hosts_path(&self.host, self.port, pubkey, path)
        } else {
            russh::keys::check_known_hosts(&self.host, self.port, pubkey)
        };

        match result {
            Ok(matched) => Ok(matched),
            Err(russh::keys::Error::KeyChanged { line }) => Err(TransportError::HostKeyChanged {
                host: self.host.clone(),
                port: self.port,
                line,
            }),
            Err(e) => Err(TransportError::KnownHosts(e.to_string())),
        }
    }

    /// Save a new host key to known_hosts.
    fn learn_host_key(&self, pubkey: &PublicKey) -> std::result::Result<(), TransportError> {
        let result = if let Some(ref path) = self.known_hosts_path {
            russh::keys::known_hosts::learn_known_hosts_path(&self.host, self.port, pubkey, path)
        } else {
            russh::keys::known_hosts::learn_known_hosts(&self.host, self.port, pubkey)
        };

        result.map_err(|e| TransportError::KnownHosts(e.to_string()))
    }

    fn reject(&self, error: TransportError) -> bool {
        if let Ok(mut slot) = self.host_key_error.lock() {
            *slot = Some(error);
        }
        false
    }
}

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match self.host_key_verification {
            HostKeyVerification::Disabled => Ok(true),

            HostKeyVerification::AcceptNew => match self.check_known_hosts(server_public_key) {
                Ok(true) => Ok(true),
                Ok(false) => {
                    // Unknown host, learn the key
                    if let Err(e) = self.learn_host_key(server_public_key) {
                        warn!("Failed to save host key: {}", e);
                    }
                    Ok(true)
                }
                Err(e) => Ok(self.reject(e)),
            },

            HostKeyVerification::Strict => match self.check_known_hosts(server_public_key) {
                Ok(true) => Ok(true),
                Ok(false) => Ok(self.reject(TransportError::HostKeyUnknown {
                    host: self.host.clone(),
                    port: self.port,
                })),
                Err(e) => Ok(self.reject(e)),
            },
        }
    }
}
