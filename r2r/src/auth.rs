//! Authentication strategy selection.
//!
//! Each side of a bridge is negotiated on its own: overrides are merged
//! field by field with the resolved config, then either an identity file or
//! an interactively entered password is chosen.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use secrecy::SecretString;

use crate::config::{DEFAULT_PORT, ResolvedHost, expand_tilde};
use crate::error::{AuthError, ConfigError, Result};

/// Caller-supplied values for one side, taking precedence over ssh_config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overrides {
    /// Login name.
    pub username: Option<String>,

    /// SSH port. The default port means "not overridden".
    pub port: u16,

    /// Private key path.
    pub identity_file: Option<PathBuf>,
}

impl Default for Overrides {
    fn default() -> Self {
        Self {
            username: None,
            port: DEFAULT_PORT,
            identity_file: None,
        }
    }
}

/// Connection target after merging overrides with the resolved config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalHost {
    pub alias: String,
    pub hostname: String,
    pub username: String,
    pub port: u16,
}

impl FinalHost {
    /// `user@host`, used to address prompts and diagnostics.
    pub fn target(&self) -> String {
        format!("{}@{}", self.username, self.hostname)
    }
}

/// Which authentication arm was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    IdentityFile,
    Password,
}

/// Credentials for one session. Secrets are redacted in `Debug` output.
#[derive(Debug)]
pub enum AuthDecision {
    /// Private key authentication.
    IdentityFile {
        /// Path to the private key file.
        path: PathBuf,
        /// Passphrase for encrypted keys.
        passphrase: Option<SecretString>,
    },

    /// Password authentication.
    Password(SecretString),
}

impl AuthDecision {
    pub fn mode(&self) -> AuthMode {
        match self {
            AuthDecision::IdentityFile { .. } => AuthMode::IdentityFile,
            AuthDecision::Password(_) => AuthMode::Password,
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMode::IdentityFile => write!(f, "identity file"),
            AuthMode::Password => write!(f, "password"),
        }
    }
}

/// Source of masked secrets (passwords, key passphrases).
pub trait SecretPrompt: Send + Sync {
    /// Ask for a secret without echoing it.
    fn prompt_secret(&self, prompt: &str) -> io::Result<SecretString>;
}

/// Prompts on the controlling terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

impl SecretPrompt for TerminalPrompt {
    fn prompt_secret(&self, prompt: &str) -> io::Result<SecretString> {
        rpassword::prompt_password(prompt).map(SecretString::from)
    }
}

/// Merges overrides and decides how to authenticate one side.
pub struct AuthNegotiator<'a> {
    prompt: &'a dyn SecretPrompt,
    interactive: bool,
}

impl<'a> AuthNegotiator<'a> {
    /// `interactive = false` turns every prompt into an error.
    pub fn new(prompt: &'a dyn SecretPrompt, interactive: bool) -> Self {
        Self {
            prompt,
            interactive,
        }
    }

    /// Merge `overrides` into `resolved` and pick an authentication arm.
    ///
    /// Shorthand for [`merge`] followed by [`AuthNegotiator::credentials`].
    pub fn decide(
        &self,
        resolved: &ResolvedHost,
        overrides: &Overrides,
    ) -> Result<(FinalHost, AuthDecision)> {
        let host = merge(resolved, overrides)?;
        let auth = self.credentials(&host, resolved, overrides)?;
        Ok((host, auth))
    }

    /// Pick an authentication arm for an already merged host, prompting for
    /// a password or key passphrase when needed.
    ///
    /// A configured identity file that does not exist is not fatal: a
    /// warning is logged and password authentication is used instead.
    pub fn credentials(
        &self,
        host: &FinalHost,
        resolved: &ResolvedHost,
        overrides: &Overrides,
    ) -> Result<AuthDecision> {
        let identity = overrides
            .identity_file
            .clone()
            .or_else(|| resolved.identity_file.clone())
            .map(|path| expand_tilde(&path.to_string_lossy()));

        let usable_identity = match identity {
            Some(path) if path.exists() => Some(path),
            Some(path) => {
                warn!("Identity file '{}' not found", path.display());
                None
            }
            None => None,
        };

        let auth = match usable_identity {
            Some(path) => {
                let passphrase = if key_is_encrypted(&path) {
                    let prompt = format!("Enter passphrase for key '{}': ", path.display());
                    Some(self.ask(&prompt, host)?)
                } else {
                    None
                };
                AuthDecision::IdentityFile { path, passphrase }
            }
            None => {
                let prompt = format!("Enter password for {}: ", host.target());
                AuthDecision::Password(self.ask(&prompt, host)?)
            }
        };

        debug!("{} authenticates with {}", host.target(), auth.mode());
        Ok(auth)
    }

    fn ask(&self, prompt: &str, host: &FinalHost) -> Result<SecretString> {
        if !self.interactive {
            return Err(AuthError::PromptUnavailable {
                user: host.username.clone(),
                host: host.hostname.clone(),
            }
            .into());
        }

        self.prompt.prompt_secret(prompt).map_err(|source| {
            AuthError::Prompt {
                target: host.target(),
                source,
            }
            .into()
        })
    }
}

/// Field-by-field merge of overrides over resolved values.
///
/// Fails with a configuration error when no username is known. Never
/// prompts.
pub fn merge(resolved: &ResolvedHost, overrides: &Overrides) -> Result<FinalHost> {
    let username = overrides
        .username
        .clone()
        .filter(|u| !u.is_empty())
        .or_else(|| resolved.username.clone())
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ConfigError::MissingUsername {
            alias: resolved.alias.clone(),
            hostname: resolved.hostname.clone(),
        })?;

    let port = if overrides.port != DEFAULT_PORT {
        overrides.port
    } else {
        resolved.port
    };

    Ok(FinalHost {
        alias: resolved.alias.clone(),
        hostname: resolved.hostname.clone(),
        username,
        port,
    })
}

/// Whether `path` holds an OpenSSH private key protected by a passphrase.
///
/// Files that cannot be parsed are reported as unencrypted; loading them
/// fails later with a key error from the session.
fn key_is_encrypted(path: &Path) -> bool {
    let Ok(content) = std::fs::read_to_string(path) else {
        return false;
    };
    match ssh_key::PrivateKey::from_openssh(content.as_bytes()) {
        Ok(key) => key.is_encrypted(),
        Err(e) => {
            debug!("could not inspect key {}: {}", path.display(), e);
            false
        }
    }
}
