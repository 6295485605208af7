//! Errors returned by the ref cache and the key store facade.

use thiserror::Error;

use crate::storage::{InvalidNameError, KeyPath, StorageError};

/// Result type for cache and store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors seen by callers of the key store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// key, user or ref does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// the caller's last seen version is stale
    #[error("version conflict on {key}: expected {expected}, found {}", .actual.as_deref().unwrap_or("nothing"))]
    VersionConflict {
        key: String,
        expected: String,
        actual: Option<String>,
    },

    /// another operation on the key (or the whole ref) is in flight
    #[error("failed to lock {0}: another operation is in flight")]
    FailedToLock(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// tag refs, directory deletes and protected keys
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// repository error with no more specific meaning
    #[error("repository error: {0}")]
    Repository(StorageError),

    /// `reload_all` finished with some keys failing to refresh
    #[error("reload failed for {} key(s): {}", .failures.len(), failures_display(.failures))]
    Reload { failures: Vec<(KeyPath, StorageError)> },

    /// the repo writer thread is gone
    #[error("repo writer has shut down")]
    WriterClosed,
}

fn failures_display(failures: &[(KeyPath, StorageError)]) -> String {
    failures
        .iter()
        .map(|(key, err)| format!("{}: {}", key, err))
        .collect::<Vec<_>>()
        .join("; ")
}

impl StoreError {
    /// true for outcomes a well-formed request can legitimately produce;
    /// anything else is worth recording as a fault
    pub fn is_expected(&self) -> bool {
        !matches!(
            self,
            StoreError::Repository(_) | StoreError::Reload { .. } | StoreError::WriterClosed
        )
    }

    /// true when retrying later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::FailedToLock(_))
    }
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::KeyNotFound { key, .. } => StoreError::NotFound(key),
            StorageError::UserNotFound(user) => StoreError::NotFound(user),
            StorageError::RefNotFound(reference) => StoreError::NotFound(reference),
            StorageError::KeyAlreadyExists { key, .. } => StoreError::AlreadyExists(key),
            StorageError::UserAlreadyExists(user) => StoreError::AlreadyExists(user),
            StorageError::RefAlreadyExists(reference) => StoreError::AlreadyExists(reference),
            StorageError::VersionMismatch { key, expected, actual } => {
                StoreError::VersionConflict { key, expected, actual }
            }
            StorageError::ReadOnlyRef(reference) => StoreError::Unsupported(format!("{} is read-only", reference)),
            StorageError::InvalidName(e) => StoreError::InvalidKey(e.to_string()),
            other => StoreError::Repository(other),
        }
    }
}

impl From<InvalidNameError> for StoreError {
    fn from(err: InvalidNameError) -> Self {
        StoreError::InvalidKey(err.to_string())
    }
}
