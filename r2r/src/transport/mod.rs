//! SSH transport layer wrapping russh and russh-sftp.
//!
//! This module provides connection setup, authentication, SFTP session
//! management and deterministic teardown.

pub mod config;
mod session;
mod ssh;

pub use config::{DEFAULT_CONNECT_TIMEOUT, HostKeyVerification, SshConfig};
pub use session::{Connector, RemoteSession, SecureSession, SshConnector};
pub use ssh::SshTransport;
