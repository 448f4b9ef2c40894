//! Cache errors
//!
//! Only the fallible `try_*` operations and [`crate::FileCache::open`]
//! surface these. Everything else logs and degrades to a cache miss.

// Derived Diagnostic impls read every field; rustc 1.92 flags them anyway
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::{Path, PathBuf};
use thiserror::Error;

fn describe(path: Option<&Path>) -> String {
    path.map_or(String::new(), |p| format!(": {}", p.display()))
}

/// Error type for file cache operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// A filesystem call on a cached file, the source, or the directory failed
    #[error("I/O {operation} failed{}", describe(path.as_deref()))]
    #[diagnostic(
        code(sidechain::cache::io),
        help("Check file permissions and ensure the cache directory is writable")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// File or directory involved
        path: Option<PathBuf>,
        /// Filesystem call that failed (`copy`, `rename`, ...)
        operation: &'static str,
    },

    /// Limits or directory rejected by validation
    #[error("Cache configuration error: {message}")]
    #[diagnostic(code(sidechain::cache::config))]
    Configuration {
        /// What was wrong with the configuration
        message: String,
    },

    /// Cache key rejected before touching the disk
    #[error("Invalid cache key: {message}")]
    #[diagnostic(code(sidechain::cache::invalid_key))]
    InvalidKey {
        /// Why the key was rejected
        message: String,
    },

    /// Payload does not fit in the cache at all
    #[error("Payload of {size} bytes exceeds the cache limit of {max} bytes")]
    #[diagnostic(
        code(sidechain::cache::too_large),
        help("Raise the maximum cache size or store the file elsewhere")
    )]
    TooLarge {
        /// Size of the rejected payload
        size: u64,
        /// Configured maximum cache size
        max: u64,
    },

    /// The manifest could not be encoded
    #[error("Failed to encode cache manifest{}", describe(Some(path.as_path())))]
    #[diagnostic(code(sidechain::cache::manifest))]
    Manifest {
        /// Manifest file being written
        path: PathBuf,
        /// Encoder error
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    /// I/O failure on `path`
    #[must_use]
    pub fn io(source: std::io::Error, path: impl AsRef<Path>, operation: &'static str) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().to_path_buf()),
            operation,
        }
    }

    /// Rejected configuration
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Rejected key
    #[must_use]
    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::InvalidKey {
            message: message.into(),
        }
    }

    /// Manifest encoding failure
    #[must_use]
    pub fn manifest(path: impl AsRef<Path>, source: serde_json::Error) -> Self {
        Self::Manifest {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mentions_path_and_operation() {
        let err = Error::io(
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
            Path::new("/cache/abc.cache"),
            "copy",
        );
        assert_eq!(err.to_string(), "I/O copy failed: /cache/abc.cache");
    }

    #[test]
    fn test_too_large_error() {
        let err = Error::TooLarge {
            size: 2048,
            max: 1024,
        };
        assert_eq!(
            err.to_string(),
            "Payload of 2048 bytes exceeds the cache limit of 1024 bytes"
        );
        assert!(Diagnostic::help(&err).is_some());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Error>();
    }
}
