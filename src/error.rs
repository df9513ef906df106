//! Error types for mirror operations.

use std::io;
use thiserror::Error;

/// Errors that can occur while synchronizing a bucket to the local mirror.
#[derive(Error, Debug)]
pub enum SyncError {
    /// I/O error during file operations.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Configuration is invalid; reported before any I/O happens.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The target bucket is missing or the credentials were rejected.
    #[error("bucket check failed: {0}")]
    Bucket(String),

    /// An object-store request failed.
    #[error("remote request failed: {0}")]
    Remote(String),

    /// A listing page could not be fetched within the retry budget.
    #[error("page fetch timed out after {attempts} attempt(s)")]
    PageRetriesExhausted { attempts: usize },

    /// The bytes written for an object do not add up to its size.
    #[error("written bytes not equal file size for {key}: expected {expected}, wrote {written}")]
    SizeMismatch {
        key: String,
        expected: i64,
        written: u64,
    },

    /// The object looks like an archive we do not know how to expand.
    #[error("unsupported archive type: {0}")]
    UnsupportedArchive(String),

    /// The run was cancelled or hit its deadline.
    #[error("operation cancelled")]
    Cancelled,
}

impl SyncError {
    /// True for errors that invalidate the whole run rather than one item.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Config(_)
                | SyncError::Bucket(_)
                | SyncError::PageRetriesExhausted { .. }
                | SyncError::Cancelled
        )
    }
}
