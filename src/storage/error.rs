//! Storage layer error types
//!
//! All errors that can occur during storage operations are defined here
//! We use `thiserror` for ergonomic error definition and better error messages

use std::path::PathBuf;

use thiserror::Error;

use crate::storage::types::InvalidNameError;

/// the main error type for storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// error from the underlying Git library
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// the requested key was not found on the ref
    #[error("key not found: ref={reference}, key={key}")]
    KeyNotFound { reference: String, key: String },

    /// the key already exists
    #[error("key already exists: ref={reference}, key={key}")]
    KeyAlreadyExists { reference: String, key: String },

    /// the caller's expected version is stale
    #[error("version mismatch on {key}: expected {expected}, found {}", .actual.as_deref().unwrap_or("nothing"))]
    VersionMismatch {
        key: String,
        expected: String,
        actual: Option<String>,
    },

    /// invalid key, ref or user name
    #[error("invalid name: {0}")]
    InvalidName(#[from] InvalidNameError),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// the specified branch/ref was not found
    #[error("ref not found: {0}")]
    RefNotFound(String),

    /// the ref already exists
    #[error("ref already exists: {0}")]
    RefAlreadyExists(String),

    /// the ref cannot be written (tags)
    #[error("ref is read-only: {0}")]
    ReadOnlyRef(String),

    /// credential file not found
    #[error("user not found: {0}")]
    UserNotFound(String),

    /// credential file already exists
    #[error("user already exists: {0}")]
    UserAlreadyExists(String),

    /// I/O error (filesystem level)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// repo is not initialized
    #[error("repository not initialized: {0}")]
    NotInitialized(PathBuf),

    /// the commit was not found
    #[error("commit not found: {0}")]
    CommitNotFound(String),

    /// the tree entry has an unexpected type
    #[error("unexpected entry type at {path}: expected {expected}, found {found}")]
    UnexpectedEntryType {
        path: PathBuf,
        expected: String,
        found: String,
    },

    /// internal error that shouldn't happen
    #[error("internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// check if this error indicates the resource doesn't exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::KeyNotFound { .. }
                | StorageError::RefNotFound(_)
                | StorageError::UserNotFound(_)
                | StorageError::CommitNotFound(_)
        )
    }

    /// check if this error is a conflict
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StorageError::KeyAlreadyExists { .. }
                | StorageError::UserAlreadyExists(_)
                | StorageError::RefAlreadyExists(_)
                | StorageError::VersionMismatch { .. }
        )
    }

    /// check if this error is an expected outcome of a well-formed request
    /// rather than a repository fault
    pub fn is_expected(&self) -> bool {
        self.is_not_found()
            || self.is_conflict()
            || matches!(
                self,
                StorageError::InvalidName(_) | StorageError::ReadOnlyRef(_)
            )
    }
}

/// result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
