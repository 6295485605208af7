//!  Reference management.
//!
//!  Git refs are pointers to commits. This module handles:
//! - default branch bootstrap
//! - ref resolution, creation, force updates and deletion
//! - private staging refs used while a push is validated
//!
//! Staging refs use a namespaced pattern: `refs/heads/_staging/{ulid}`
//! This makes them easy to hide from clients and to clean up.

use git2::Repository;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{CommitId, RefName};

/// Manages Git references.
pub struct RefManager;

impl RefManager {
    /// Resolve a ref to its current commit ID.
    pub fn resolve(repo: &Repository, name: &RefName) -> StorageResult<CommitId> {
        Self::try_resolve(repo, name)?.ok_or_else(|| StorageError::RefNotFound(name.to_string()))
    }

    /// Resolve a ref, `None` when it does not exist.
    ///
    /// Unlike [`RefManager::resolve`], errors other than "not found" (an
    /// unreadable ref database) are propagated rather than folded into
    /// `RefNotFound`.
    pub fn try_resolve(repo: &Repository, name: &RefName) -> StorageResult<Option<CommitId>> {
        let reference = match repo.find_reference(name.as_str()) {
            Ok(reference) => reference,
            Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::Git(e)),
        };

        let commit = reference.peel_to_commit()?;
        Ok(Some(CommitId::new(commit.id())))
    }

    /// Check if a ref exists.
    pub fn exists(repo: &Repository, name: &RefName) -> bool {
        repo.find_reference(name.as_str()).is_ok()
    }

    /// Create a new ref pointing to the given commit.
    pub fn create(repo: &Repository, name: &RefName, target: CommitId) -> StorageResult<()> {
        if Self::exists(repo, name) {
            return Err(StorageError::RefAlreadyExists(name.to_string()));
        }

        repo.reference(name.as_str(), target.raw(), false, &format!("create {}", name))?;

        Ok(())
    }

    /// Update a ref only if it still points to the expected commit.
    ///
    /// This provides compare-and-swap semantics for safe concurrent updates.
    pub fn update_if_unchanged(
        repo: &Repository,
        name: &RefName,
        expected: CommitId,
        new_target: CommitId,
    ) -> StorageResult<()> {
        let moved = repo.reference_matching(
            name.as_str(),
            new_target.raw(),
            true,
            expected.raw(),
            &format!("update {} to {}", name, new_target.short()),
        );

        match moved {
            Ok(_) => Ok(()),
            Err(e) if e.code() == git2::ErrorCode::Modified || e.code() == git2::ErrorCode::NotFound => {
                Err(StorageError::VersionMismatch {
                    key: name.to_string(),
                    expected: expected.to_string(),
                    actual: Self::resolve(repo, name).ok().map(|id| id.to_string()),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a ref.
    pub fn delete(repo: &Repository, name: &RefName) -> StorageResult<()> {
        let mut reference = repo
            .find_reference(name.as_str())
            .map_err(|_| StorageError::RefNotFound(name.to_string()))?;

        reference.delete()?;

        Ok(())
    }

    /// List all refs whose full name starts with `prefix`.
    pub fn list(repo: &Repository, prefix: &str) -> StorageResult<Vec<RefName>> {
        let mut result = Vec::new();
        for reference in repo.references()? {
            let reference = reference?;
            if let Some(name) = reference.name() {
                if name.starts_with(prefix) {
                    if let Ok(ref_name) = RefName::new(name) {
                        result.push(ref_name);
                    }
                }
            }
        }
        result.sort();

        Ok(result)
    }

    /// List all staging refs.
    pub fn list_staging_refs(repo: &Repository) -> StorageResult<Vec<RefName>> {
        Self::list(repo, RefName::STAGING_PREFIX)
    }

    /// Create a fresh staging ref at `target`.
    pub fn create_staging_ref(repo: &Repository, target: CommitId) -> StorageResult<RefName> {
        let name = RefName::staging();
        Self::create(repo, &name, target)?;
        Ok(name)
    }

    /// Remove staging refs left behind by an interrupted push.
    ///
    /// Only safe while no push is in flight, i.e. at startup.
    pub fn cleanup_staging_refs(repo: &Repository) -> StorageResult<usize> {
        let mut deleted = 0;
        for name in Self::list_staging_refs(repo)? {
            if Self::delete(repo, &name).is_ok() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Initialize the default branch if it doesn't exist and point HEAD at it.
    pub fn init_default_branch(repo: &Repository, branch: &RefName, initial_commit: CommitId) -> StorageResult<()> {
        if !Self::exists(repo, branch) {
            Self::create(repo, branch, initial_commit)?;
        }

        repo.set_head(branch.as_str())?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tree::create_initial_tree;
    use tempfile::TempDir;

    fn setup_repo_with_commit() -> (TempDir, Repository, CommitId) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();

        // scope the borrows
        let commit_id = {
            let tree_id = create_initial_tree(&repo).unwrap();
            let tree = repo.find_tree(tree_id.raw()).unwrap();
            let sig = git2::Signature::now("Test", "test@test.com").unwrap();

            let commit_oid = repo
                .commit(Some("refs/heads/master"), &sig, &sig, "Initial commit", &tree, &[])
                .unwrap();

            CommitId::new(commit_oid)
        };

        RefManager::init_default_branch(&repo, &RefName::new("master").unwrap(), commit_id).unwrap();

        (dir, repo, commit_id)
    }

    fn second_commit(repo: &Repository, parent: CommitId) -> CommitId {
        let tree_id = create_initial_tree(repo).unwrap();
        let tree = repo.find_tree(tree_id.raw()).unwrap();
        let sig = git2::Signature::now("Test", "test@test.com").unwrap();
        let parent = repo.find_commit(parent.raw()).unwrap();
        CommitId::new(
            repo.commit(None, &sig, &sig, "Second commit", &tree, &[&parent])
                .unwrap(),
        )
    }

    #[test]
    fn test_ref_lifecycle() {
        let (_dir, repo, base_commit) = setup_repo_with_commit();

        let branch = RefName::new("feature").unwrap();

        assert!(!RefManager::exists(&repo, &branch));
        assert_eq!(RefManager::try_resolve(&repo, &branch).unwrap(), None);
        RefManager::create(&repo, &branch, base_commit).unwrap();
        assert!(RefManager::exists(&repo, &branch));

        let resolved = RefManager::resolve(&repo, &branch).unwrap();
        assert_eq!(resolved, base_commit);

        RefManager::delete(&repo, &branch).unwrap();
        assert!(!RefManager::exists(&repo, &branch));
        assert!(matches!(
            RefManager::resolve(&repo, &branch),
            Err(StorageError::RefNotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_ref_error() {
        let (_dir, repo, base_commit) = setup_repo_with_commit();
        let branch = RefName::new("feature").unwrap();

        RefManager::create(&repo, &branch, base_commit).unwrap();
        let result = RefManager::create(&repo, &branch, base_commit);

        assert!(matches!(result, Err(StorageError::RefAlreadyExists(_))));
    }

    #[test]
    fn test_staging_refs() {
        let (_dir, repo, base_commit) = setup_repo_with_commit();

        let staging1 = RefManager::create_staging_ref(&repo, base_commit).unwrap();
        let staging2 = RefManager::create_staging_ref(&repo, base_commit).unwrap();
        assert_ne!(staging1, staging2);
        assert!(staging1.is_staging());

        assert_eq!(RefManager::list_staging_refs(&repo).unwrap().len(), 2);

        let deleted = RefManager::cleanup_staging_refs(&repo).unwrap();
        assert_eq!(deleted, 2);
        assert!(RefManager::list_staging_refs(&repo).unwrap().is_empty());
    }

    #[test]
    fn test_update_if_unchanged() {
        let (_dir, repo, commit1) = setup_repo_with_commit();
        let branch = RefName::new("test").unwrap();
        RefManager::create(&repo, &branch, commit1).unwrap();

        let commit2 = second_commit(&repo, commit1);

        RefManager::update_if_unchanged(&repo, &branch, commit1, commit2).unwrap();
        assert_eq!(RefManager::resolve(&repo, &branch).unwrap(), commit2);

        // stale expectation is refused
        assert!(matches!(
            RefManager::update_if_unchanged(&repo, &branch, commit1, commit2),
            Err(StorageError::VersionMismatch { .. })
        ));
    }
}
