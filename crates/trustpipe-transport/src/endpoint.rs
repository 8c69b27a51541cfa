use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Result, TransportError};

/// Environment variable overriding the directory used for bare pipe names (Unix only).
pub const SOCKET_DIR_ENV: &str = "TRUSTPIPE_SOCKET_DIR";

/// A pipe name resolved to the platform endpoint it addresses.
///
/// Pipe names are local identifiers, never network addresses:
/// - Unix: a name containing `/` is used as the socket path verbatim,
///   otherwise the socket lives at `<dir>/<name>.sock` where `<dir>` is
///   `$TRUSTPIPE_SOCKET_DIR` or the system temp directory.
/// - Windows: `\\.\pipe\<name>` unless the name is already a pipe path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    name: String,
    path: PathBuf,
}

impl Endpoint {
    /// Resolve a pipe name.
    pub fn from_name(name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(TransportError::InvalidName {
                name: name.to_string(),
                reason: "name must not be empty",
            });
        }
        if name.contains('\0') {
            return Err(TransportError::InvalidName {
                name: name.to_string(),
                reason: "name must not contain NUL",
            });
        }

        Ok(Self {
            name: name.to_string(),
            path: resolve_path(name),
        })
    }

    /// The name this endpoint was resolved from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The platform path of the endpoint.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

#[cfg(unix)]
fn resolve_path(name: &str) -> PathBuf {
    if name.contains('/') {
        return PathBuf::from(name);
    }
    let dir = std::env::var_os(SOCKET_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    dir.join(format!("{name}.sock"))
}

#[cfg(windows)]
fn resolve_path(name: &str) -> PathBuf {
    if name.starts_with(r"\\") {
        PathBuf::from(name)
    } else {
        PathBuf::from(format!(r"\\.\pipe\{name}"))
    }
}
