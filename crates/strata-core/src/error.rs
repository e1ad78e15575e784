//! Error types for Strata core operations.
//!
//! This module defines well-structured error types using `thiserror` for
//! library-level errors, while higher-level code can use `anyhow` for
//! convenient error handling.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using StrataError
pub type Result<T> = std::result::Result<T, StrataError>;

/// Core error types for Strata operations.
///
/// These errors represent specific failure modes that callers may want to
/// handle differently (e.g., requesting a full rebuild after a failed
/// commit, or retrying after a wiped store).
#[derive(Error, Debug)]
pub enum StrataError {
    // === Registry Errors ===
    /// The registry cannot allocate another index id
    #[error("too many registered indexes: limit is {max}")]
    TooManyIndexes { max: u16 },

    /// An index id was used that the registry has never issued
    #[error("unknown index id {id}")]
    UnknownIndex { id: u16 },

    // === Store Errors ===
    /// A backing file exists but is corrupted or unreadable
    #[error("store '{name}' is corrupted: {reason}")]
    StoreCorrupted { name: String, reason: String },

    /// The store failed to open twice, even after a wipe
    #[error("store '{name}' unusable after wipe-and-retry: {reason}")]
    StoreUnusable { name: String, reason: String },

    /// The on-disk format version is newer than this build understands
    #[error("store format version mismatch: found {found}, expected {expected}")]
    FormatVersionMismatch { found: u32, expected: u32 },

    // === Mode Errors ===
    /// An index read was attempted while rebuild work is pending
    #[error("index data is not queryable while dumb mode is active")]
    DumbMode,

    /// The coordinator has been disposed; no further work is accepted
    #[error("coordinator is disposed")]
    Disposed,

    // === Update Errors ===
    /// A cancellation checkpoint fired, or a status check found work
    #[error("operation cancelled")]
    Cancelled,

    /// Per-file extraction failed; the batch continues without this file
    #[error("extraction failed for {path}: {reason}")]
    Extraction { path: PathBuf, reason: String },

    // === Configuration Errors ===
    /// Configuration file parsing failed
    #[error("configuration error: {reason}")]
    ConfigError { reason: String },

    // === I/O Errors ===
    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Serialization Errors ===
    /// Serialization/deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    // === Internal Errors ===
    /// Internal error that should not happen
    #[error("internal error: {0}")]
    Internal(String),
}

impl StrataError {
    /// Returns true if the affected index must be fully rebuilt before
    /// its data can be trusted again.
    pub fn requires_rebuild(&self) -> bool {
        matches!(
            self,
            StrataError::StoreCorrupted { .. }
                | StrataError::StoreUnusable { .. }
                | StrataError::FormatVersionMismatch { .. }
                | StrataError::Io(_)
        )
    }

    /// Returns true if this is a cancellation signal rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StrataError::Cancelled)
    }

    /// Create a store corruption error
    pub fn corrupted(name: impl Into<String>, reason: impl Into<String>) -> Self {
        StrataError::StoreCorrupted {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(reason: impl Into<String>) -> Self {
        StrataError::Serialization(reason.into())
    }
}

impl From<bincode::Error> for StrataError {
    fn from(err: bincode::Error) -> Self {
        StrataError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_rebuild() {
        let err = StrataError::StoreCorrupted {
            name: "words".to_string(),
            reason: "bad magic".to_string(),
        };
        assert!(err.requires_rebuild());

        let err = StrataError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert!(err.requires_rebuild());

        let err = StrataError::DumbMode;
        assert!(!err.requires_rebuild());
    }

    #[test]
    fn test_cancelled_is_not_rebuild() {
        let err = StrataError::Cancelled;
        assert!(err.is_cancelled());
        assert!(!err.requires_rebuild());
    }
}
