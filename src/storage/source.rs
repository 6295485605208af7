//! The narrow interface the cache engine and push pipeline use to talk to
//! the repository.
//!
//! Every call is synchronous; asynchrony and ordering are layered on top by
//! the cache engine's repo writer.

use crate::storage::commit::CommitMetadata;
use crate::storage::document::{Metadata, UserRecord};
use crate::storage::error::StorageResult;
use crate::storage::types::{BlobId, CommitId, KeyPath, RefName, UserPath};

/// What the repository currently holds for one key on one ref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    /// last commit that wrote the payload, `None` for directory keys
    pub data_version: Option<CommitId>,
    pub data_blob: Option<BlobId>,
    /// last commit that wrote the metadata file, `None` when there is none
    pub metadata_version: Option<CommitId>,
    pub metadata_blob: Option<BlobId>,
}

/// Key-level access to a Git repository.
///
/// `get_source_info` and the writes fail with `StorageError::RefNotFound`
/// when the ref does not exist, and the conditional writes fail with
/// `StorageError::VersionMismatch` when the expected version is stale.
pub trait GitSource: Send + Sync {
    /// current state of `key` on `reference`, `None` when absent
    fn get_source_info(&self, key: &KeyPath, reference: &RefName) -> StorageResult<Option<SourceInfo>>;

    /// read a blob referenced by a [`SourceInfo`]
    fn read_blob(&self, blob: BlobId) -> StorageResult<Vec<u8>>;

    /// create a key with its metadata; fails if the key exists
    fn add_key(
        &self,
        key: &KeyPath,
        reference: &RefName,
        payload: &[u8],
        metadata: &Metadata,
        commit: &CommitMetadata,
    ) -> StorageResult<CommitId>;

    /// replace a key's payload if its version is still `expected`
    fn modify_key(
        &self,
        key: &KeyPath,
        reference: &RefName,
        payload: &[u8],
        expected: CommitId,
        commit: &CommitMetadata,
    ) -> StorageResult<CommitId>;

    /// delete a key and its metadata if its version is still `expected`
    fn delete_key(
        &self,
        key: &KeyPath,
        reference: &RefName,
        expected: CommitId,
        commit: &CommitMetadata,
    ) -> StorageResult<CommitId>;

    /// write a key's (or directory's) metadata
    ///
    /// `expected` is the metadata version the caller last saw; `None` means
    /// the caller expects no metadata file to exist yet.
    fn modify_metadata(
        &self,
        key: &KeyPath,
        reference: &RefName,
        metadata: &Metadata,
        expected: Option<CommitId>,
        commit: &CommitMetadata,
    ) -> StorageResult<CommitId>;

    /// create `reference` at the current tip of `from`
    fn create_ref(&self, reference: &RefName, from: &RefName) -> StorageResult<CommitId>;

    /// delete `reference`
    fn delete_ref(&self, reference: &RefName) -> StorageResult<()>;

    /// tree paths under directory `prefix` (`/` is the root)
    fn get_list(&self, prefix: &KeyPath, reference: &RefName, recursive: bool) -> StorageResult<Vec<String>>;

    fn get_user(&self, user: &UserPath, reference: &RefName) -> StorageResult<Option<UserRecord>>;

    fn add_user(
        &self,
        user: &UserPath,
        reference: &RefName,
        record: &UserRecord,
        commit: &CommitMetadata,
    ) -> StorageResult<CommitId>;

    fn update_user(
        &self,
        user: &UserPath,
        reference: &RefName,
        record: &UserRecord,
        commit: &CommitMetadata,
    ) -> StorageResult<CommitId>;

    fn delete_user(&self, user: &UserPath, reference: &RefName, commit: &CommitMetadata) -> StorageResult<CommitId>;
}
