//! Error taxonomy surfaced to callers of a [`WatcherEngine`](crate::engine::WatcherEngine).
//!
//! Only two kinds are exposed, matching the contract a façade would translate
//! into a signed `WatchID`: a missing path, and everything else bundled as
//! free text from the OS.

use std::fmt;
use std::path::PathBuf;

/// Errors returned synchronously from [`WatcherEngine::add_watch`](crate::engine::WatcherEngine::add_watch).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The path passed to `add_watch` does not exist.
    FileNotFound(PathBuf),
    /// Any other OS-level failure (resource exhaustion, permission denied, ...).
    Unspecified(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::FileNotFound(path) => write!(f, "path not found: {}", path.display()),
            Error::Unspecified(detail) => write!(f, "{detail}"),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    pub(crate) fn io(path: &std::path::Path, err: std::io::Error) -> Error {
        if err.kind() == std::io::ErrorKind::NotFound {
            Error::FileNotFound(path.to_path_buf())
        } else {
            Error::Unspecified(err.to_string())
        }
    }

    pub(crate) fn generic(detail: impl Into<String>) -> Error {
        Error::Unspecified(detail.into())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
