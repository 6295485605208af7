//! Content checks for pushed commits.

use thiserror::Error;

use crate::storage::{
    Change, CommitId, GitRepository, GitSource, InvalidNameError, KeyPath, Metadata, StorageError, StorageResult,
    UserPath, UserRecord,
};

/// Why a pushed file is not acceptable.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("object for {path} is missing")]
    MissingObject { path: String },

    #[error("invalid metadata in {path}: {source}")]
    Metadata {
        path: String,
        #[source]
        source: StorageError,
    },

    #[error("invalid credential path {path}: {source}")]
    UserPath {
        path: String,
        #[source]
        source: InvalidNameError,
    },

    #[error("invalid credential file {path}: {source}")]
    UserRecord {
        path: String,
        #[source]
        source: StorageError,
    },

    #[error("missing commit {0}")]
    MissingCommit(CommitId),
}

/// Check every file added or modified between `old` (or the empty tree)
/// and `new`.
///
/// Returns every problem found; an empty list means the push is
/// acceptable. The outer error is for repository failures, not content.
pub fn validate_push(
    repo: &GitRepository,
    old: Option<CommitId>,
    new: CommitId,
) -> StorageResult<Vec<ValidationError>> {
    if !repo.has_commit(new)? {
        return Ok(vec![ValidationError::MissingCommit(new)]);
    }
    let old = match old {
        Some(old) if repo.has_commit(old)? => Some(old),
        _ => None,
    };

    let mut problems = Vec::new();
    for change in repo.diff(old, new)? {
        if let Some(problem) = check_change(repo, &change)? {
            problems.push(problem);
        }
    }
    Ok(problems)
}

fn check_change(repo: &GitRepository, change: &Change) -> StorageResult<Option<ValidationError>> {
    let blob = match change.new_blob {
        Some(blob) => blob,
        None => return Ok(None),
    };
    let path = change.path.as_str();
    if !repo.has_blob(blob)? {
        return Ok(Some(ValidationError::MissingObject { path: path.to_string() }));
    }

    if path.starts_with(UserPath::ROOT) {
        if let Err(source) = UserPath::from_tree_path(path) {
            return Ok(Some(ValidationError::UserPath {
                path: path.to_string(),
                source,
            }));
        }
        let bytes = repo.read_blob(blob)?;
        return Ok(UserRecord::from_slice(&bytes).err().map(|source| ValidationError::UserRecord {
            path: path.to_string(),
            source,
        }));
    }

    if path.ends_with(KeyPath::METADATA_SUFFIX) {
        let bytes = repo.read_blob(blob)?;
        return Ok(Metadata::from_slice(&bytes).err().map(|source| ValidationError::Metadata {
            path: path.to_string(),
            source,
        }));
    }

    // payloads are opaque
    Ok(None)
}
