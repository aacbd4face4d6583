// src/error.rs

//! Error taxonomy for the database engine.
//!
//! Per-package degradation (broken files, broken scripts) is deliberately
//! not represented here: those are persisted flags on the installed
//! package, not control-flow errors. Everything a caller can branch on is
//! a distinct variant.

use std::io;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed installed-database record. The line number is 1-based.
    #[error("installed database format error on line {line}")]
    FdbFormat { line: usize },

    /// Malformed repository index.
    #[error("repository index format error on line {line}")]
    IndexFormat { line: usize },

    /// Archive or file content digest differs from the expected value.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// No configured repository provides the requested package.
    #[error("package {0} not found in any repository")]
    PackageNotFound(String),

    /// The package is missing from the chosen repository's cached index.
    #[error("package {0} missing from cached index; index may be stale")]
    IndexStale(String),

    /// A writable cache directory is required but not available.
    #[error("package cache is not available")]
    CacheNotAvailable,

    /// Install would overwrite a file owned by another package.
    #[error("{path} already owned by {owner}")]
    Conflict { path: String, owner: String },

    /// Stale or unavailable repositories were seen during open and the
    /// caller refused to continue without them.
    #[error("{unavailable} unavailable and {stale} stale repositories")]
    RepositoryCheck { unavailable: usize, stale: usize },

    /// The exclusive database lock could not be acquired.
    #[error("unable to lock database")]
    LockFailed,

    /// The database directory could not be read.
    #[error("unable to read database: {0}")]
    DatabaseRead(String),

    /// A lifecycle script terminated abnormally.
    #[error("script {name}: {status}")]
    Script { name: String, status: String },

    /// Malformed dependency expression.
    #[error("invalid dependency: {0}")]
    InvalidDependency(String),

    /// Malformed checksum string.
    #[error("invalid checksum: {0}")]
    InvalidChecksum(String),

    /// Path rejected by sanitization.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// A formatted name exceeded its fixed-size buffer.
    #[error("name too long: {0}")]
    NameTooLong(String),

    /// The repository tag table is full or the tag is malformed.
    #[error("invalid repository tag: {0}")]
    InvalidTag(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// True for errors the installer treats as per-file (records
    /// `broken_files` and continues) rather than aborting the unpack.
    pub fn is_per_file(&self) -> bool {
        matches!(self, Error::Conflict { .. } | Error::InvalidPath(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_conversion() {
        let err: Error = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_display_messages() {
        let err = Error::FdbFormat { line: 12 };
        assert_eq!(err.to_string(), "installed database format error on line 12");
        let err = Error::Conflict {
            path: "usr/bin/foo".to_string(),
            owner: "tool-a-1.0-r0".to_string(),
        };
        assert_eq!(err.to_string(), "usr/bin/foo already owned by tool-a-1.0-r0");
    }

    #[test]
    fn test_per_file_classification() {
        assert!(Error::InvalidPath("../etc/shadow".to_string()).is_per_file());
        assert!(!Error::LockFailed.is_per_file());
    }
}
