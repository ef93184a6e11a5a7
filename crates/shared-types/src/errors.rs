//! # Error Types
//!
//! Errors shared by repository ports and metadata conversions.

use thiserror::Error;

/// Errors returned by repository implementations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// Requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Write conflicts with an existing record.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The backend failed.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Errors converting version metadata.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    /// Version string is not `[v]MAJOR.MINOR.PATCH`.
    #[error("invalid semantic version: {0:?}")]
    InvalidSemVer(String),

    /// Version is set but the build timestamp is missing.
    #[error("version {0} has no build timestamp")]
    MissingTimestamp(String),
}
