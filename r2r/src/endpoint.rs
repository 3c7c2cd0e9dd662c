//! `alias:path` endpoint specifiers.

use std::fmt;
use std::str::FromStr;

use crate::error::UsageError;

/// A parsed `alias:path` endpoint.
///
/// The specifier is split on the first `:` only, so any further colons are
/// part of the remote path (`host1:/tmp/a:b.txt` names `/tmp/a:b.txt`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
    host_alias: String,
    remote_path: String,
}

impl EndpointSpec {
    /// Parse an `alias:path` string.
    pub fn parse(spec: &str) -> Result<Self, UsageError> {
        let (alias, path) = spec
            .split_once(':')
            .ok_or_else(|| UsageError::MissingSeparator {
                spec: spec.to_string(),
            })?;

        if alias.is_empty() {
            return Err(UsageError::EmptyAlias {
                spec: spec.to_string(),
            });
        }
        if path.is_empty() {
            return Err(UsageError::EmptyPath {
                spec: spec.to_string(),
            });
        }

        Ok(Self {
            host_alias: alias.to_string(),
            remote_path: path.to_string(),
        })
    }

    /// The host alias (ssh_config `Host` name or a literal hostname).
    pub fn host_alias(&self) -> &str {
        &self.host_alias
    }

    /// The remote path, absolute or relative to the remote home directory.
    pub fn remote_path(&self) -> &str {
        &self.remote_path
    }
}

impl FromStr for EndpointSpec {
    type Err = UsageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for EndpointSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_alias, self.remote_path)
    }
}
