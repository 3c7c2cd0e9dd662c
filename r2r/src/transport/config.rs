//! SSH connection configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::auth::{AuthDecision, FinalHost};

/// Default bound on how long connecting and authenticating may take.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Host key verification mode, analogous to OpenSSH's `StrictHostKeyChecking`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HostKeyVerification {
    /// Only hosts already in known_hosts are accepted.
    Strict,

    /// Unknown hosts are recorded in known_hosts on first contact; a key
    /// that differs from the recorded one is rejected.
    #[default]
    AcceptNew,

    /// No checking at all.
    Disabled,
}

/// SSH connection configuration for one side of a bridge.
#[derive(Debug)]
pub struct SshConfig {
    /// Target host (hostname or IP address).
    pub host: String,

    /// SSH port (default: 22).
    pub port: u16,

    /// Username for authentication.
    pub username: String,

    /// Authentication method.
    pub auth: AuthDecision,

    /// Connection timeout.
    pub timeout: Duration,

    /// Host key verification mode.
    pub host_key_verification: HostKeyVerification,

    /// Path to known_hosts file.
    pub known_hosts_path: Option<PathBuf>,
}

impl SshConfig {
    /// Build a config from a negotiated host and its credentials.
    pub fn new(host: FinalHost, auth: AuthDecision) -> Self {
        Self {
            host: host.hostname,
            port: host.port,
            username: host.username,
            auth,
            timeout: DEFAULT_CONNECT_TIMEOUT,
            host_key_verification: HostKeyVerification::default(),
            known_hosts_path: None,
        }
    }

    /// Get the socket address for connection.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `user@host`, for diagnostics.
    pub fn target(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}
