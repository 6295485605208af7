//!   Core Git repository wrapper.
//!
//!  This is the central component of the storage layer. It wraps
//!  `git2::Repository` with thread-safe access and implements [`GitSource`],
//!  the key-level interface the rest of the system uses.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::Repository;
use parking_lot::Mutex;
use tracing::debug;

use crate::storage::blob;
use crate::storage::commit::{self, CommitBuilder, CommitInfo, CommitMessage, CommitMetadata};
use crate::storage::document::{Metadata, UserRecord};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::refs::RefManager;
use crate::storage::source::{GitSource, SourceInfo};
use crate::storage::tree::TreeMutator;
use crate::storage::types::{BlobId, Change, CommitId, GitSignature, KeyPath, RefName, UserPath};

/// The main Git repository wrapper.
///
/// Clone this to share across threads - it uses Arc internally.
/// `git2::Repository` is `Send` but not `Sync`, so access goes through a
/// mutex rather than a read/write lock.
#[derive(Clone)]
pub struct GitRepository {
    inner: Arc<GitRepositoryInner>,
}

struct GitRepositoryInner {
    repo: Mutex<Repository>,
    path: PathBuf,
}

impl GitRepository {
    /// Open an existing repository.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let repo = Repository::open(path).map_err(|_| StorageError::NotInitialized(path.to_path_buf()))?;

        Ok(Self::from_repository(repo, path))
    }

    /// Initialize a new repository with an empty initial commit on
    /// `default_branch`.
    pub fn init(path: impl AsRef<Path>, default_branch: &RefName) -> StorageResult<Self> {
        let path = path.as_ref();
        let repo = Repository::init(path)?;
        let storage = Self::from_repository(repo, path);

        storage.with_repo(|repo| {
            let commit_id = commit::create_initial_commit(repo, &GitSignature::gitkv(), default_branch.as_str())?;
            RefManager::init_default_branch(repo, default_branch, commit_id)?;
            Ok(())
        })?;

        Ok(storage)
    }

    /// Open or initialize a repository.
    pub fn open_or_init(path: impl AsRef<Path>, default_branch: &RefName) -> StorageResult<Self> {
        let path = path.as_ref();
        if path.join(".git").exists() {
            Self::open(path)
        } else {
            Self::init(path, default_branch)
        }
    }

    fn from_repository(repo: Repository, path: &Path) -> Self {
        Self {
            inner: Arc::new(GitRepositoryInner {
                repo: Mutex::new(repo),
                path: path.to_path_buf(),
            }),
        }
    }

    /// Get the repository path.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Execute a function with exclusive access to the repository.
    pub fn with_repo<F, T>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Repository) -> StorageResult<T>,
    {
        let repo = self.inner.repo.lock();
        f(&repo)
    }

    // ==================== Ref Operations ====================

    /// Get the commit ID a ref points to.
    pub fn resolve(&self, name: &RefName) -> StorageResult<CommitId> {
        self.with_repo(|repo| RefManager::resolve(repo, name))
    }

    /// Get the commit ID a ref points to, `None` when it doesn't exist.
    pub fn try_resolve(&self, name: &RefName) -> StorageResult<Option<CommitId>> {
        self.with_repo(|repo| RefManager::try_resolve(repo, name))
    }

    /// Create a private staging ref at `target`.
    pub fn create_staging_ref(&self, target: CommitId) -> StorageResult<RefName> {
        self.with_repo(|repo| RefManager::create_staging_ref(repo, target))
    }

    /// Remove staging refs left behind by an interrupted push.
    pub fn cleanup_staging_refs(&self) -> StorageResult<usize> {
        self.with_repo(RefManager::cleanup_staging_refs)
    }

    /// List refs with a name prefix.
    pub fn list_refs(&self, prefix: &str) -> StorageResult<Vec<RefName>> {
        self.with_repo(|repo| RefManager::list(repo, prefix))
    }

    /// Check if a ref exists.
    pub fn ref_exists(&self, name: &RefName) -> StorageResult<bool> {
        self.with_repo(|repo| Ok(RefManager::exists(repo, name)))
    }

    /// Create a ref at `target`; fails if it already exists.
    pub fn create_ref_at(&self, name: &RefName, target: CommitId) -> StorageResult<()> {
        self.with_repo(|repo| RefManager::create(repo, name, target))
    }

    /// Move a ref to `target` only if it still points at `expected`.
    pub fn update_ref_if_unchanged(&self, name: &RefName, expected: CommitId, target: CommitId) -> StorageResult<()> {
        self.with_repo(|repo| RefManager::update_if_unchanged(repo, name, expected, target))
    }

    // ==================== History Operations ====================

    /// Get information about a commit.
    pub fn get_commit(&self, id: CommitId) -> StorageResult<CommitInfo> {
        self.with_repo(|repo| commit::get_commit(repo, id))
    }

    /// Get the changes between two commits; `old` of `None` means the
    /// empty tree.
    pub fn diff(&self, old: Option<CommitId>, new: CommitId) -> StorageResult<Vec<Change>> {
        self.with_repo(|repo| commit::diff_commits(repo, old, new))
    }

    /// Check whether a commit object is present.
    pub fn has_commit(&self, id: CommitId) -> StorageResult<bool> {
        self.with_repo(|repo| Ok(repo.find_commit(id.raw()).is_ok()))
    }

    /// Check whether a blob object is present.
    pub fn has_blob(&self, id: BlobId) -> StorageResult<bool> {
        self.with_repo(|repo| Ok(blob::blob_exists(repo, id)))
    }

    // ==================== Helpers ====================

    /// Write `edits` (path -> new blob, or removal) on top of the tip of
    /// `reference` and advance the ref.
    fn commit_edits(
        repo: &Repository,
        reference: &RefName,
        tip: CommitId,
        edits: &[(String, Option<BlobId>)],
        meta: &CommitMetadata,
    ) -> StorageResult<CommitId> {
        let tree = commit::get_tree_at_commit(repo, tip)?;
        let mut mutator = TreeMutator::from_tree(repo, &tree);
        for (path, blob) in edits {
            match blob {
                Some(id) => mutator.upsert(path, *id)?,
                None => {
                    mutator.remove(path)?;
                }
            }
        }
        let new_tree_id = mutator.write()?;

        let paths: Vec<&str> = edits.iter().map(|(p, _)| p.as_str()).collect();
        let message = CommitMessage::with_paths(&meta.message, &paths);
        let id = CommitBuilder::new(repo)
            .tree(new_tree_id)
            .parent(tip)
            .metadata(meta)
            .message(message)
            .update_ref(reference.as_str())
            .commit()?;

        debug!(target: "gitkv::storage", "committed {} on {} ({} paths)", id.short(), reference, paths.len());
        Ok(id)
    }

    fn writable_tip(repo: &Repository, reference: &RefName) -> StorageResult<CommitId> {
        if reference.is_tag() {
            return Err(StorageError::ReadOnlyRef(reference.to_string()));
        }
        RefManager::resolve(repo, reference)
    }

    fn key_not_found(key: &KeyPath, reference: &RefName) -> StorageError {
        StorageError::KeyNotFound {
            reference: reference.to_string(),
            key: key.to_string(),
        }
    }

    fn check_version(key: &KeyPath, expected: Option<CommitId>, actual: Option<CommitId>) -> StorageResult<()> {
        if expected != actual {
            return Err(StorageError::VersionMismatch {
                key: key.to_string(),
                expected: expected.map(|c| c.to_string()).unwrap_or_else(|| "nothing".to_string()),
                actual: actual.map(|c| c.to_string()),
            });
        }
        Ok(())
    }

    fn data_path(key: &KeyPath) -> StorageResult<&str> {
        key.data_path()
            .ok_or_else(|| StorageError::Internal(format!("directory key {} has no payload", key)))
    }

    fn user_write(
        &self,
        user: &UserPath,
        reference: &RefName,
        record: Option<&UserRecord>,
        must_exist: bool,
        commit: &CommitMetadata,
    ) -> StorageResult<CommitId> {
        self.with_repo(|repo| {
            let tip = Self::writable_tip(repo, reference)?;
            let path = user.tree_path();
            let exists = commit::get_tree_at_commit(repo, tip)?.blob_at(&path)?.is_some();
            if must_exist && !exists {
                return Err(StorageError::UserNotFound(user.to_string()));
            }
            if !must_exist && exists {
                return Err(StorageError::UserAlreadyExists(user.to_string()));
            }

            let blob = match record {
                Some(record) => Some(blob::write_json(repo, record)?),
                None => None,
            };
            Self::commit_edits(repo, reference, tip, &[(path, blob)], commit)
        })
    }
}

impl GitSource for GitRepository {
    fn get_source_info(&self, key: &KeyPath, reference: &RefName) -> StorageResult<Option<SourceInfo>> {
        self.with_repo(|repo| {
            let tip = RefManager::resolve(repo, reference)?;
            let tree = commit::get_tree_at_commit(repo, tip)?;

            let metadata_path = key.metadata_path();
            let metadata_blob = tree.file_at(&metadata_path)?;

            // a directory at the data path is simply not a key
            let (data_blob, data_version) = match key.data_path() {
                Some(path) => match tree.file_at(path)? {
                    Some(blob) => (Some(blob), commit::last_commit_touching(repo, tip, path)?),
                    None => return Ok(None),
                },
                None if metadata_blob.is_none() => return Ok(None),
                None => (None, None),
            };

            let metadata_version = match metadata_blob {
                Some(_) => commit::last_commit_touching(repo, tip, &metadata_path)?,
                None => None,
            };

            Ok(Some(SourceInfo {
                data_version,
                data_blob,
                metadata_version,
                metadata_blob,
            }))
        })
    }

    fn read_blob(&self, id: BlobId) -> StorageResult<Vec<u8>> {
        self.with_repo(|repo| blob::read_blob(repo, id))
    }

    fn add_key(
        &self,
        key: &KeyPath,
        reference: &RefName,
        payload: &[u8],
        metadata: &Metadata,
        commit: &CommitMetadata,
    ) -> StorageResult<CommitId> {
        let data_path = Self::data_path(key)?;
        self.with_repo(|repo| {
            let tip = Self::writable_tip(repo, reference)?;
            let tree = commit::get_tree_at_commit(repo, tip)?;
            if tree.occupied(data_path)? {
                return Err(StorageError::KeyAlreadyExists {
                    reference: reference.to_string(),
                    key: key.to_string(),
                });
            }

            let data_blob = blob::write_blob(repo, payload)?;
            let metadata_blob = blob::write_json(repo, metadata)?;
            Self::commit_edits(
                repo,
                reference,
                tip,
                &[
                    (data_path.to_string(), Some(data_blob)),
                    (key.metadata_path(), Some(metadata_blob)),
                ],
                commit,
            )
        })
    }

    fn modify_key(
        &self,
        key: &KeyPath,
        reference: &RefName,
        payload: &[u8],
        expected: CommitId,
        commit: &CommitMetadata,
    ) -> StorageResult<CommitId> {
        let data_path = Self::data_path(key)?;
        self.with_repo(|repo| {
            let tip = Self::writable_tip(repo, reference)?;
            let current = commit::last_commit_touching(repo, tip, data_path)?
                .ok_or_else(|| Self::key_not_found(key, reference))?;
            Self::check_version(key, Some(expected), Some(current))?;

            let data_blob = blob::write_blob(repo, payload)?;
            Self::commit_edits(repo, reference, tip, &[(data_path.to_string(), Some(data_blob))], commit)
        })
    }

    fn delete_key(
        &self,
        key: &KeyPath,
        reference: &RefName,
        expected: CommitId,
        commit: &CommitMetadata,
    ) -> StorageResult<CommitId> {
        let data_path = Self::data_path(key)?;
        self.with_repo(|repo| {
            let tip = Self::writable_tip(repo, reference)?;
            let current = commit::last_commit_touching(repo, tip, data_path)?
                .ok_or_else(|| Self::key_not_found(key, reference))?;
            Self::check_version(key, Some(expected), Some(current))?;

            Self::commit_edits(
                repo,
                reference,
                tip,
                &[(data_path.to_string(), None), (key.metadata_path(), None)],
                commit,
            )
        })
    }

    fn modify_metadata(
        &self,
        key: &KeyPath,
        reference: &RefName,
        metadata: &Metadata,
        expected: Option<CommitId>,
        commit: &CommitMetadata,
    ) -> StorageResult<CommitId> {
        self.with_repo(|repo| {
            let tip = Self::writable_tip(repo, reference)?;
            if let Some(path) = key.data_path() {
                if commit::get_tree_at_commit(repo, tip)?.file_at(path)?.is_none() {
                    return Err(Self::key_not_found(key, reference));
                }
            }

            let metadata_path = key.metadata_path();
            let current = commit::last_commit_touching(repo, tip, &metadata_path)?;
            Self::check_version(key, expected, current)?;

            let metadata_blob = blob::write_json(repo, metadata)?;
            Self::commit_edits(repo, reference, tip, &[(metadata_path, Some(metadata_blob))], commit)
        })
    }

    fn create_ref(&self, reference: &RefName, from: &RefName) -> StorageResult<CommitId> {
        self.with_repo(|repo| {
            let tip = RefManager::resolve(repo, from)?;
            RefManager::create(repo, reference, tip)?;
            Ok(tip)
        })
    }

    fn delete_ref(&self, reference: &RefName) -> StorageResult<()> {
        self.with_repo(|repo| RefManager::delete(repo, reference))
    }

    fn get_list(&self, prefix: &KeyPath, reference: &RefName, recursive: bool) -> StorageResult<Vec<String>> {
        let dir = if prefix.as_str() == "/" { "" } else { prefix.as_str() };
        self.with_repo(|repo| {
            let tip = RefManager::resolve(repo, reference)?;
            let tree = commit::get_tree_at_commit(repo, tip)?;
            tree.list(repo, dir, recursive)
        })
    }

    fn get_user(&self, user: &UserPath, reference: &RefName) -> StorageResult<Option<UserRecord>> {
        self.with_repo(|repo| {
            let tip = RefManager::resolve(repo, reference)?;
            let tree = commit::get_tree_at_commit(repo, tip)?;
            match tree.blob_at(&user.tree_path())? {
                Some(id) => Ok(Some(UserRecord::from_slice(&blob::read_blob(repo, id)?)?)),
                None => Ok(None),
            }
        })
    }

    fn add_user(
        &self,
        user: &UserPath,
        reference: &RefName,
        record: &UserRecord,
        commit: &CommitMetadata,
    ) -> StorageResult<CommitId> {
        self.user_write(user, reference, Some(record), false, commit)
    }

    fn update_user(
        &self,
        user: &UserPath,
        reference: &RefName,
        record: &UserRecord,
        commit: &CommitMetadata,
    ) -> StorageResult<CommitId> {
        self.user_write(user, reference, Some(record), true, commit)
    }

    fn delete_user(&self, user: &UserPath, reference: &RefName, commit: &CommitMetadata) -> StorageResult<CommitId> {
        self.user_write(user, reference, None, true, commit)
    }
}

impl std::fmt::Debug for GitRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitRepository").field("path", &self.inner.path).finish()
    }
}
