//! Host alias resolution from an OpenSSH-style client configuration file.
//!
//! Parsing and `Host` pattern matching are done by `ssh2-config`. Only the
//! directives that matter for opening an SFTP session are turned into typed
//! values: `HostName`, `User`, `Port` and `IdentityFile`. Every other keyword
//! is accepted and ignored so that ordinary `~/.ssh/config` files keep
//! working.

use std::io;
use std::path::{Path, PathBuf};

use log::debug;
use ssh2_config::{ParseRule, SshConfig};

use crate::error::ConfigError;

/// Port used when neither an override nor the config file names one.
pub const DEFAULT_PORT: u16 = 22;

/// Connection parameters for one alias after reading the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHost {
    /// The alias the parameters were resolved for.
    pub alias: String,

    /// Host to connect to. Falls back to the alias itself.
    pub hostname: String,

    /// Login name, if the config file names one.
    pub username: Option<String>,

    /// SSH port (default: 22).
    pub port: u16,

    /// First `IdentityFile` entry, with `~` expanded.
    pub identity_file: Option<PathBuf>,
}

impl ResolvedHost {
    /// Parameters for an alias that has no configuration at all.
    pub fn defaults(alias: impl Into<String>) -> Self {
        let alias = alias.into();
        Self {
            hostname: alias.clone(),
            alias,
            username: None,
            port: DEFAULT_PORT,
            identity_file: None,
        }
    }
}

/// Resolves host aliases against a per-user config file.
#[derive(Debug, Clone)]
pub struct HostConfigResolver {
    config_path: Option<PathBuf>,
}

impl HostConfigResolver {
    /// Resolver reading `~/.ssh/config`.
    pub fn new() -> Self {
        Self {
            config_path: default_config_path(),
        }
    }

    /// Resolver reading an explicit config file.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Path of the config file this resolver reads, if any.
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Resolve an alias into connection parameters.
    ///
    /// A missing config file, or an alias the file does not mention, yields
    /// the defaults: hostname = alias, no user, port 22, no identity.
    pub fn resolve(&self, alias: &str) -> Result<ResolvedHost, ConfigError> {
        let Some(path) = self.config_path.as_deref() else {
            debug!("no home directory; using defaults for {alias}");
            return Ok(ResolvedHost::defaults(alias));
        };

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no SSH config at {}", path.display());
                return Ok(ResolvedHost::defaults(alias));
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let config = SshConfigFile::parse(path, &content)?;
        let resolved = config.resolve(alias)?;
        debug!(
            "resolved {} -> {}@{}:{} identity={:?}",
            alias,
            resolved.username.as_deref().unwrap_or("?"),
            resolved.hostname,
            resolved.port,
            resolved.identity_file
        );
        Ok(resolved)
    }
}

impl Default for HostConfigResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".ssh").join("config"))
}

/// A parsed ssh_config file.
#[derive(Debug)]
pub struct SshConfigFile {
    path: PathBuf,
    inner: SshConfig,
}

impl SshConfigFile {
    /// Parse config file content. `path` is used for error messages only.
    ///
    /// Keywords that do not affect an SFTP session are accepted and ignored.
    /// A recognised keyword with a bad or missing value is an error.
    pub fn parse(path: &Path, content: &str) -> Result<Self, ConfigError> {
        let mut reader = io::BufReader::new(content.as_bytes());
        let inner = SshConfig::default()
            .parse(
                &mut reader,
                ParseRule::ALLOW_UNKNOWN_FIELDS | ParseRule::ALLOW_UNSUPPORTED_FIELDS,
            )
            .map_err(|e| ConfigError::Malformed {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        Ok(Self {
            path: path.to_path_buf(),
            inner,
        })
    }

    /// Resolve an alias into [`ResolvedHost`].
    ///
    /// Every matching `Host` block contributes and the first value seen for
    /// each field wins. Only the first `IdentityFile` is used.
    pub fn resolve(&self, alias: &str) -> Result<ResolvedHost, ConfigError> {
        let params = self.inner.query(alias);

        let port = match params.port {
            Some(0) => {
                return Err(ConfigError::Malformed {
                    path: self.path.clone(),
                    message: format!("invalid port 0 for host {alias}"),
                });
            }
            Some(port) => port,
            None => DEFAULT_PORT,
        };

        let identity_file = params
            .identity_file
            .as_ref()
            .and_then(|files| files.first())
            .map(|path| expand_tilde(&path.to_string_lossy()));

        Ok(ResolvedHost {
            alias: alias.to_string(),
            hostname: params.host_name.unwrap_or_else(|| alias.to_string()),
            username: params.user,
            port,
            identity_file,
        })
    }
}

/// Expand a leading `~` to the user's home directory.
pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
