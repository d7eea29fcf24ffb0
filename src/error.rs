//! Error types for drive-fetch
//!
//! This module provides:
//! - The crate-wide [`Error`] used by every pipeline stage
//! - Stage-specific errors for block verification and decryption/assembly
//! - [`GetFileError`], the failure taxonomy surfaced to callers of `get_file`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for drive-fetch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for drive-fetch
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "parallelism")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Remote returned a non-success HTTP status
    #[error("HTTP {status} fetching {url}")]
    Http {
        /// Response status code
        status: u16,
        /// Requested URL
        url: String,
    },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Caller passed an argument that can never succeed
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Remote metadata (revision, link) not found
    #[error("not found: {0}")]
    NotFound(String),

    /// A block failed hash verification
    #[error("verification error: {0}")]
    Verification(#[from] VerificationError),

    /// Decryption or reassembly failed
    #[error("assembly error: {0}")]
    Assembly(#[from] AssemblyError),

    /// A block that the coordinator reported as present has no local file
    #[error("block {index} has no local file at {path}")]
    MissingBlockFile {
        /// Block index
        index: u32,
        /// Expected location
        path: PathBuf,
    },

    /// Download state change not allowed by the lifecycle
    #[error("invalid state transition for {link_id}: {from} -> {to}")]
    InvalidTransition {
        /// Link whose state was being changed
        link_id: String,
        /// Current state name
        from: &'static str,
        /// Requested state name
        to: &'static str,
    },

    /// Cooperative cancellation observed
    #[error("operation cancelled")]
    Cancelled,

    /// Shutdown in progress - not accepting new downloads
    #[error("shutdown in progress: not accepting new downloads")]
    ShuttingDown,

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Stored row could not be decoded
    #[error("corrupt record for {link_id}: {reason}")]
    CorruptRecord {
        /// Link whose row is corrupt
        link_id: String,
        /// What failed to decode
        reason: String,
    },
}

/// Block hash verification failure
#[derive(Debug, Error)]
pub enum VerificationError {
    /// Content hash differs from the manifest
    #[error("block {index} hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        /// Block index
        index: u32,
        /// Hash from the manifest
        expected: String,
        /// Hash of the local content
        actual: String,
    },
}

/// Decryption/assembly failure kinds
#[derive(Debug, Error)]
pub enum AssemblyError {
    /// Manifest signature did not verify
    #[error("manifest signature verification failed: {0}")]
    SignatureVerification(String),

    /// Generic decryption failure
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// One or more verified blocks are no longer on disk
    #[error("{count} block file(s) missing")]
    MissingBlocks {
        /// Number of missing block files
        count: usize,
    },
}

/// Failure kinds reported to `get_file` callers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum GetFileError {
    /// No connectivity and the request was not retryable
    #[error("no network connection")]
    NoConnection,
    /// Post-download verification failed even after re-download
    #[error("downloaded blocks are invalid")]
    InvalidBlocks,
    /// A single block did not match its manifest hash
    #[error("block hash verification failed")]
    Verification,
    /// Manifest signature invalid
    #[error("signature verification failed")]
    SignatureVerification,
    /// Generic decryption failure
    #[error("decryption failed")]
    Decryption,
    /// Downloaded blocks vanished before decryption
    #[error("downloaded blocks are missing")]
    MissingBlocks,
    /// Remote metadata missing
    #[error("not found")]
    NotFound,
    /// The download was cancelled
    #[error("cancelled")]
    Cancelled,
    /// Anything else
    #[error("{0}")]
    Other(String),
}

impl From<&Error> for GetFileError {
    fn from(error: &Error) -> Self {
        match error {
            Error::NotFound(_) => GetFileError::NotFound,
            Error::Verification(_) => GetFileError::Verification,
            Error::Assembly(AssemblyError::SignatureVerification(_)) => {
                GetFileError::SignatureVerification
            }
            Error::Assembly(AssemblyError::Decryption(_)) => GetFileError::Decryption,
            Error::Assembly(AssemblyError::MissingBlocks { .. }) => GetFileError::MissingBlocks,
            Error::Cancelled => GetFileError::Cancelled,
            other => GetFileError::Other(other.to_string()),
        }
    }
}

impl From<Error> for GetFileError {
    fn from(error: Error) -> Self {
        GetFileError::from(&error)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembly_errors_map_to_distinct_kinds() {
        let cases = vec![
            (
                Error::Assembly(AssemblyError::SignatureVerification("bad".into())),
                GetFileError::SignatureVerification,
            ),
            (
                Error::Assembly(AssemblyError::Decryption("bad key".into())),
                GetFileError::Decryption,
            ),
            (
                Error::Assembly(AssemblyError::MissingBlocks { count: 2 }),
                GetFileError::MissingBlocks,
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(GetFileError::from(&error), expected, "mapping {error}");
        }
    }

    #[test]
    fn not_found_and_cancel_map_through() {
        assert_eq!(
            GetFileError::from(Error::NotFound("revision r1".into())),
            GetFileError::NotFound
        );
        assert_eq!(GetFileError::from(Error::Cancelled), GetFileError::Cancelled);
    }

    #[test]
    fn hash_mismatch_is_reported_as_block_verification() {
        let error = Error::Verification(VerificationError::HashMismatch {
            index: 3,
            expected: "aa".into(),
            actual: "bb".into(),
        });
        assert_eq!(error.to_string(), "verification error: block 3 hash mismatch: expected aa, got bb");
        assert_eq!(GetFileError::from(&error), GetFileError::Verification);
        assert_ne!(GetFileError::from(&error), GetFileError::InvalidBlocks);
    }

    #[test]
    fn unclassified_errors_keep_their_message() {
        let error = Error::Http {
            status: 503,
            url: "https://blocks.example/1".into(),
        };
        assert_eq!(
            GetFileError::from(&error),
            GetFileError::Other("HTTP 503 fetching https://blocks.example/1".into())
        );
    }

    #[test]
    fn get_file_error_serializes_kind() {
        let json = serde_json::to_value(GetFileError::NoConnection).unwrap();
        assert_eq!(json["kind"], "no_connection");
    }
}
