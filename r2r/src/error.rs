//! Error types for r2r.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Main error type for r2r operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed command-line input
    #[error("Usage error: {0}")]
    Usage(#[from] UsageError),

    /// Local configuration problems
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Credential acquisition or rejection
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// SSH transport-level errors
    #[error("Connection error: {0}")]
    Transport(#[from] TransportError),

    /// Failures while moving file data
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// An error attributed to one side of the bridge and the phase it failed in
    #[error("{side} {phase} failed: {source}")]
    Endpoint {
        side: Side,
        phase: Phase,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Attach side and phase context to an error.
    pub fn at(side: Side, phase: Phase, source: impl Into<Error>) -> Self {
        Error::Endpoint {
            side,
            phase,
            source: Box::new(source.into()),
        }
    }

    /// The stable category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Usage(_) => ErrorKind::Usage,
            Error::Config(_) => ErrorKind::Configuration,
            Error::Auth(_) => ErrorKind::Authentication,
            Error::Transport(_) => ErrorKind::Connection,
            Error::Transfer(TransferError::Cancelled { .. }) => ErrorKind::Cancelled,
            Error::Transfer(_) => ErrorKind::Transfer,
            Error::Endpoint { source, .. } => source.kind(),
        }
    }

    /// The side of the bridge this error belongs to, if known.
    pub fn side(&self) -> Option<Side> {
        match self {
            Error::Endpoint { side, .. } => Some(*side),
            _ => None,
        }
    }

    /// The phase this error happened in, if known.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Error::Endpoint { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// The innermost error, with any side/phase wrapping removed.
    pub fn root(&self) -> &Error {
        match self {
            Error::Endpoint { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Stable error categories surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Usage,
    Configuration,
    Authentication,
    Connection,
    Transfer,
    Cancelled,
}

/// One leg of a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Source,
    Destination,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Source => write!(f, "source"),
            Side::Destination => write!(f, "destination"),
        }
    }
}

/// Step of the bridge sequence in which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Resolve,
    Auth,
    Connect,
    Transfer,
    Cleanup,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Resolve => "resolve",
            Phase::Auth => "auth",
            Phase::Connect => "connect",
            Phase::Transfer => "transfer",
            Phase::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

/// Malformed input, detected before any network activity.
#[derive(Error, Debug)]
pub enum UsageError {
    /// Endpoint has no `:` separator
    #[error("Invalid endpoint '{spec}', use HOST_ALIAS:/path/to/file")]
    MissingSeparator { spec: String },

    /// Endpoint has nothing before the `:`
    #[error("Invalid endpoint '{spec}': host alias is empty")]
    EmptyAlias { spec: String },

    /// Endpoint has nothing after the `:`
    #[error("Invalid endpoint '{spec}': remote path is empty")]
    EmptyPath { spec: String },

    /// Options that cannot be combined
    #[error("Conflicting options: {message}")]
    ConflictingOptions { message: String },
}

/// Local configuration errors (ssh_config, missing parameters).
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No username from overrides or ssh_config
    #[error("Username required for {alias} (host {hostname})")]
    MissingUsername { alias: String, hostname: String },

    /// ssh_config content could not be parsed
    #[error("{}: {message}", path.display())]
    Malformed { path: PathBuf, message: String },

    /// ssh_config exists but could not be read
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Authentication errors.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Credentials rejected by the server
    #[error("Authentication failed for {user}@{host}")]
    Rejected { user: String, host: String },

    /// Private key could not be loaded
    #[error("Failed to load key '{}': {message}", path.display())]
    Key { path: PathBuf, message: String },

    /// Interactive prompt failed
    #[error("Failed to read secret for {target}: {source}")]
    Prompt {
        target: String,
        #[source]
        source: io::Error,
    },

    /// A secret was needed but prompting is disabled
    #[error("A password is required for {user}@{host} but prompting is disabled")]
    PromptUnavailable { user: String, host: String },
}

/// Transport layer errors (SSH connection, handshake, subsystem).
#[derive(Error, Debug)]
pub enum TransportError {
    /// Failed to connect to host
    #[error("Connection failed to {host}:{port}: {source}")]
    ConnectionFailed {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    /// SSH handshake or protocol error
    #[error("SSH error with {host}: {source}")]
    Ssh {
        host: String,
        #[source]
        source: russh::Error,
    },

    /// Connection attempt exceeded the timeout
    #[error("Connection to {host}:{port} timed out after {timeout:?}")]
    Timeout {
        host: String,
        port: u16,
        timeout: Duration,
    },

    /// Host key not present in known_hosts (strict mode)
    #[error("Host key for {host}:{port} is not in known_hosts")]
    HostKeyUnknown { host: String, port: u16 },

    /// Host key differs from the known_hosts entry
    #[error("Host key for {host}:{port} changed (known_hosts line {line})")]
    HostKeyChanged { host: String, port: u16, line: usize },

    /// known_hosts could not be read or written
    #[error("known_hosts error: {0}")]
    KnownHosts(String),

    /// SFTP subsystem could not be started or shut down
    #[error("SFTP error on {host}: {message}")]
    Sftp { host: String, message: String },
}

/// Errors while reading or writing file data.
#[derive(Error, Debug)]
pub enum TransferError {
    /// Remote file metadata could not be read
    #[error("Failed to stat '{path}': {source}")]
    Stat {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Remote file could not be opened
    #[error("Failed to open '{path}': {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Reading from the source failed
    #[error("Read from '{path}' failed after {bytes_transferred} bytes: {source}")]
    Read {
        path: String,
        bytes_transferred: u64,
        #[source]
        source: io::Error,
    },

    /// Writing to the destination failed
    #[error("Write to '{path}' failed after {bytes_transferred} bytes: {source}")]
    Write {
        path: String,
        bytes_transferred: u64,
        #[source]
        source: io::Error,
    },

    /// Moving the finished temporary file into place failed
    #[error("Failed to rename '{from}' to '{to}': {source}")]
    Rename {
        from: String,
        to: String,
        #[source]
        source: io::Error,
    },

    /// Transfer was cancelled before completion
    #[error("Transfer cancelled after {bytes_transferred} bytes")]
    Cancelled { bytes_transferred: u64 },
}

impl TransferError {
    /// The side whose channel produced this error.
    pub fn side(&self) -> Side {
        match self {
            TransferError::Stat { .. }
            | TransferError::Read { .. }
            | TransferError::Cancelled { .. } => Side::Source,
            TransferError::Open { .. }
            | TransferError::Write { .. }
            | TransferError::Rename { .. } => Side::Destination,
        }
    }

    /// Re-attribute an error to a remote path.
    ///
    /// The transfer engine works on anonymous channels; the caller knows
    /// which remote file each end belongs to.
    pub(crate) fn with_paths(self, source_path: &str, destination_path: &str) -> Self {
        match self {
            TransferError::Read {
                bytes_transferred,
                source,
                ..
            } => TransferError::Read {
                path: source_path.to_string(),
                bytes_transferred,
                source,
            },
            TransferError::Write {
                bytes_transferred,
                source,
                ..
            } => TransferError::Write {
                path: destination_path.to_string(),
                bytes_transferred,
                source,
            },
            other => other,
        }
    }
}

/// A failure while releasing a session after the outcome was decided.
///
/// Never returned as an error; logged and attached to the result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupWarning {
    pub side: Side,
    pub message: String,
}

impl fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} cleanup: {}", self.side, self.message)
    }
}

/// Result type alias using r2r's Error.
pub type Result<T> = std::result::Result<T, Error>;
