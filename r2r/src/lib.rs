//! # r2r
//!
//! Copy a file directly between two remote hosts over SSH/SFTP.
//!
//! The file is streamed from the source host's SFTP server to the
//! destination host's SFTP server through this process, one chunk at a
//! time. Nothing is written to local disk and memory use does not grow with
//! file size.
//!
//! ## Features
//!
//! - Per-host settings from `~/.ssh/config` with explicit overrides
//! - Identity file or password authentication, negotiated per side
//! - Streaming, pipelined and whole-buffer transfer strategies
//! - Optional atomic replace of the destination file
//! - Both sessions are always closed, whichever side fails
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use r2r::BridgeBuilder;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), r2r::Error> {
//!     let options = BridgeBuilder::new()
//!         .source_username("admin")
//!         .build()?;
//!
//!     let result = r2r::bridge("hostA:/data/file.bin", "hostB:/backup/file.bin", options).await?;
//!     println!("{} bytes", result.bytes_transferred);
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod bridge;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod transfer;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use auth::{AuthDecision, AuthMode, Overrides, SecretPrompt, TerminalPrompt};
pub use bridge::{Bridge, BridgeBuilder, BridgeOptions, PreparedTransfer, TransferResult, bridge};
pub use config::{HostConfigResolver, ResolvedHost};
pub use endpoint::EndpointSpec;
pub use error::{CleanupWarning, Error, ErrorKind, Phase, Result, Side};
pub use transfer::{Progress, Strategy};
pub use transport::{HostKeyVerification, SecureSession, SshConfig, SshConnector};
