//!  Commit creation, diffing and version lookup
//!
//!  commits are the atomic units of change in Git. Here:
//! - each key mutation creates exactly one commit on its ref
//! - the end user is recorded as author, the service account as committer
//! - the version of a key is the last commit that touched its blob
//!
//! this module handles commit creation, version resolution and diff operations

use chrono::{DateTime, TimeZone, Utc};
use git2::{Delta, DiffOptions, Repository};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::tree::TreeHandle;
use crate::storage::types::{BlobId, Change, ChangeStatus, CommitId, GitSignature, TreeId};

/// trailer naming a path a commit wrote, even when the blob is unchanged
pub const PATH_TRAILER: &str = "Gitkv-Path: ";

/// information about a commit
#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub id: CommitId,
    pub tree_id: TreeId,
    pub parent_ids: Vec<CommitId>,
    pub message: String,
    pub author_name: String,
    pub author_email: String,
    pub committer_name: String,
    pub committer_email: String,
    pub timestamp: DateTime<Utc>,
}

impl CommitInfo {
    /// create CommitInfo from a git2::Commit
    pub(crate) fn from_git2(commit: &git2::Commit<'_>) -> Self {
        let author = commit.author();
        let committer = commit.committer();
        let time = commit.time();
        let timestamp = Utc
            .timestamp_opt(time.seconds(), 0)
            .single()
            .unwrap_or_else(Utc::now);

        Self {
            id: CommitId::new(commit.id()),
            tree_id: TreeId::new(commit.tree_id()),
            parent_ids: commit.parent_ids().map(CommitId::new).collect(),
            message: commit.message().unwrap_or("").to_string(),
            author_name: author.name().unwrap_or("Unknown").to_string(),
            author_email: author.email().unwrap_or("unknown@unknown").to_string(),
            committer_name: committer.name().unwrap_or("Unknown").to_string(),
            committer_email: committer.email().unwrap_or("unknown@unknown").to_string(),
            timestamp,
        }
    }

    /// get a short summary of the commit (first line of message)
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or(&self.message)
    }
}

/// Who a mutation is written for and by.
///
/// The end user becomes the commit author; the proxy user (the service
/// account technically writing the commit) is always the committer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitMetadata {
    pub author: GitSignature,
    pub proxy: GitSignature,
    pub message: String,
}

impl CommitMetadata {
    pub fn new(author_name: impl Into<String>, author_email: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            author: GitSignature::new(author_name, author_email),
            proxy: GitSignature::gitkv(),
            message: message.into(),
        }
    }

    /// set the proxy user recorded as committer
    pub fn proxy(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.proxy = GitSignature::new(name, email);
        self
    }
}

/// builder for creating commits with a fluent interface
pub struct CommitBuilder<'a> {
    repo: &'a Repository,
    tree_id: Option<TreeId>,
    parents: Vec<CommitId>,
    message: String,
    author: GitSignature,
    committer: GitSignature,
    update_ref: Option<String>,
}

impl<'a> CommitBuilder<'a> {
    /// create a new CommitBuilder
    pub fn new(repo: &'a Repository) -> Self {
        Self {
            repo,
            tree_id: None,
            parents: Vec::new(),
            message: String::new(),
            author: GitSignature::gitkv(),
            committer: GitSignature::gitkv(),
            update_ref: None,
        }
    }

    /// set the tree for this commit
    pub fn tree(mut self, tree_id: TreeId) -> Self {
        self.tree_id = Some(tree_id);
        self
    }

    /// add a parent commit
    pub fn parent(mut self, parent: CommitId) -> Self {
        self.parents.push(parent);
        self
    }

    /// set the commit message
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// set both author and committer
    pub fn signature(mut self, signature: GitSignature) -> Self {
        self.author = signature.clone();
        self.committer = signature;
        self
    }

    /// take author, committer and message from mutation metadata
    pub fn metadata(mut self, meta: &CommitMetadata) -> Self {
        self.author = meta.author.clone();
        self.committer = meta.proxy.clone();
        self.message = meta.message.clone();
        self
    }

    /// update a ref (branch) to point to this commit
    ///
    /// git refuses the update unless the ref's current tip is the first parent
    pub fn update_ref(mut self, refname: impl Into<String>) -> Self {
        self.update_ref = Some(refname.into());
        self
    }

    /// create the commit and return its ID
    pub fn commit(self) -> StorageResult<CommitId> {
        let tree_id = self
            .tree_id
            .ok_or_else(|| StorageError::Internal("commit requires a tree".to_string()))?;

        let tree = self.repo.find_tree(tree_id.raw())?;
        let author = self.author.to_git2_signature()?;
        let committer = self.committer.to_git2_signature()?;

        // collect parent commits
        let parent_commits: Vec<git2::Commit<'_>> = self
            .parents
            .iter()
            .map(|id| self.repo.find_commit(id.raw()))
            .collect::<Result<_, _>>()?;

        let parent_refs: Vec<&git2::Commit<'_>> = parent_commits.iter().collect();

        let oid = self.repo.commit(
            self.update_ref.as_deref(),
            &author,
            &committer,
            &self.message,
            &tree,
            &parent_refs,
        )?;

        Ok(CommitId::new(oid))
    }
}

/// get information about a commit
pub fn get_commit(repo: &Repository, id: CommitId) -> StorageResult<CommitInfo> {
    let commit = repo
        .find_commit(id.raw())
        .map_err(|_| StorageError::CommitNotFound(id.to_string()))?;

    Ok(CommitInfo::from_git2(&commit))
}

/// get the tree snapshot at a specific commit
pub fn get_tree_at_commit(repo: &Repository, commit_id: CommitId) -> StorageResult<TreeHandle<'_>> {
    let commit = repo
        .find_commit(commit_id.raw())
        .map_err(|_| StorageError::CommitNotFound(commit_id.to_string()))?;

    let tree = commit.tree()?;
    Ok(TreeHandle::new(tree))
}

/// create the initial commit for a new repository on `refname`
pub fn create_initial_commit(repo: &Repository, signature: &GitSignature, refname: &str) -> StorageResult<CommitId> {
    let tree_id = crate::storage::tree::create_initial_tree(repo)?;

    CommitBuilder::new(repo)
        .tree(tree_id)
        .message("[gitkv] Initialize repository")
        .signature(signature.clone())
        .update_ref(refname)
        .commit()
}

/// find the commit that produced the current content at `path`
///
/// Walks first parents from `tip` and returns the most recent commit whose
/// blob at `path` differs from its parent's, or whose message carries a path
/// trailer for `path`. Returns `None` when nothing is stored at `path`.
pub fn last_commit_touching(repo: &Repository, tip: CommitId, path: &str) -> StorageResult<Option<CommitId>> {
    let mut current = repo
        .find_commit(tip.raw())
        .map_err(|_| StorageError::CommitNotFound(tip.to_string()))?;

    let tip_blob = TreeHandle::new(current.tree()?).blob_at(path)?;
    if tip_blob.is_none() {
        return Ok(None);
    }

    loop {
        if names_path(current.message().unwrap_or(""), path) || current.parent_count() == 0 {
            return Ok(Some(CommitId::new(current.id())));
        }
        let parent = current.parent(0)?;
        let parent_blob = match TreeHandle::new(parent.tree()?).blob_at(path) {
            Ok(blob) => blob,
            // a directory used to live here
            Err(StorageError::UnexpectedEntryType { .. }) => None,
            Err(e) => return Err(e),
        };
        if parent_blob != tip_blob {
            return Ok(Some(CommitId::new(current.id())));
        }
        current = parent;
    }
}

fn names_path(message: &str, path: &str) -> bool {
    message
        .lines()
        .filter_map(|line| line.strip_prefix(PATH_TRAILER))
        .any(|p| p.trim() == path)
}

/// compute the diff between two commits
///
/// `old` of `None` diffs against the empty tree (new refs)
pub fn diff_commits(repo: &Repository, old: Option<CommitId>, new: CommitId) -> StorageResult<Vec<Change>> {
    let old_tree = match old {
        Some(id) => Some(repo.find_commit(id.raw())?.tree()?),
        None => None,
    };
    let new_tree = repo.find_commit(new.raw())?.tree()?;

    let mut opts = DiffOptions::new();
    let diff = repo.diff_tree_to_tree(old_tree.as_ref(), Some(&new_tree), Some(&mut opts))?;

    let mut changes = Vec::new();
    for delta in diff.deltas() {
        let path = delta
            .new_file()
            .path()
            .or_else(|| delta.old_file().path())
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        let status = match delta.status() {
            Delta::Added => ChangeStatus::Added,
            Delta::Deleted => ChangeStatus::Deleted,
            Delta::Modified => ChangeStatus::Modified,
            Delta::Renamed => ChangeStatus::Renamed,
            Delta::Copied => ChangeStatus::Copied,
            _ => ChangeStatus::Other,
        };

        let new_blob = match status {
            ChangeStatus::Deleted => None,
            _ => Some(BlobId::new(delta.new_file().id())),
        };

        changes.push(Change { path, status, new_blob });
    }

    Ok(changes)
}

/// message formatting for key operations
///
/// every message ends with one path trailer per file written so version
/// lookup can see rewrites of identical content
pub struct CommitMessage;

impl CommitMessage {
    /// append path trailers to a user supplied message
    pub fn with_paths(message: &str, paths: &[&str]) -> String {
        let mut out = message.trim_end().to_string();
        out.push_str("\n\n");
        for path in paths {
            out.push_str(PATH_TRAILER);
            out.push_str(path);
            out.push('\n');
        }
        out
    }

    /// fallback summary for an operation when the caller gave no message
    pub fn summary(operation: &str, target: &str) -> String {
        format!("[{}] {}", operation, target)
    }
}
