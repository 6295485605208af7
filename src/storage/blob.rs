//! Blob operations for key storage.
//!
//! Key payloads are stored verbatim; metadata and credential files are JSON
//! documents (see [`crate::storage::document`]).

use git2::{ObjectType, Repository};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::BlobId;

/// write raw bytes as a blob
pub fn write_blob(repo: &Repository, bytes: &[u8]) -> StorageResult<BlobId> {
    let oid = repo.blob(bytes)?;
    Ok(BlobId::new(oid))
}

/// write a serializable document as pretty JSON
///
/// serde_json keeps struct field order, so identical documents produce
/// identical blobs
pub fn write_json<T: serde::Serialize>(repo: &Repository, value: &T) -> StorageResult<BlobId> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_blob(repo, &bytes)
}

/// read a blob's content
pub fn read_blob(repo: &Repository, id: BlobId) -> StorageResult<Vec<u8>> {
    let object = repo.find_object(id.raw(), None)?;
    if object.kind() != Some(ObjectType::Blob) {
        return Err(StorageError::UnexpectedEntryType {
            path: id.to_string().into(),
            expected: "blob".to_string(),
            found: format!("{:?}", object.kind()),
        });
    }
    let blob = repo.find_blob(id.raw())?;
    Ok(blob.content().to_vec())
}

/// check if a blob exists in the object database
pub fn blob_exists(repo: &Repository, id: BlobId) -> bool {
    repo.find_blob(id.raw()).is_ok()
}
