//!  tree operations for key layout.
//!
//! in Git, a tree is a directory. Keys map one-to-one onto blob paths, so a
//! key `a/b/c` lives in tree `a`, subtree `b`, entry `c`.
//!
//! this module provides safe abstractions over Git's tree manipulation,
//! which is notoriously fiddly to get right: `git2::TreeBuilder` only edits a
//! single level, so nested edits are rebuilt bottom-up here.

use std::path::Path;

use git2::{FileMode, ObjectType, Oid, Repository, Tree};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{BlobId, TreeId};

/// A read only handle to a git tree at a specific commit
///
/// think of it as a snapshot - it won't change even if new commits are made.
#[derive(Debug)]
pub struct TreeHandle<'repo> {
    tree: Tree<'repo>,
}

impl<'repo> TreeHandle<'repo> {
    /// create a TreeHandle from a git2::Tree
    pub(crate) fn new(tree: Tree<'repo>) -> Self {
        Self { tree }
    }

    /// get the tree ID
    pub fn id(&self) -> TreeId {
        TreeId::new(self.tree.id())
    }

    /// get the blob at `path`, `None` if nothing is there
    pub fn blob_at(&self, path: &str) -> StorageResult<Option<BlobId>> {
        let entry = match self.tree.get_path(Path::new(path)) {
            Ok(entry) => entry,
            Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::Git(e)),
        };
        if entry.kind() != Some(ObjectType::Blob) {
            return Err(StorageError::UnexpectedEntryType {
                path: path.into(),
                expected: "blob (file)".to_string(),
                found: format!("{:?}", entry.kind()),
            });
        }
        Ok(Some(BlobId::new(entry.id())))
    }

    /// the file at `path`; `None` when nothing is there or `path` is a
    /// directory
    pub fn file_at(&self, path: &str) -> StorageResult<Option<BlobId>> {
        match self.tree.get_path(Path::new(path)) {
            Ok(entry) if entry.kind() == Some(ObjectType::Blob) => Ok(Some(BlobId::new(entry.id()))),
            Ok(_) => Ok(None),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(StorageError::Git(e)),
        }
    }

    /// true when anything, file or directory, occupies `path`
    pub fn occupied(&self, path: &str) -> StorageResult<bool> {
        match self.tree.get_path(Path::new(path)) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(false),
            Err(e) => Err(StorageError::Git(e)),
        }
    }

    /// the subtree at directory `dir` (`""` is the root)
    fn subtree(&self, repo: &'repo Repository, dir: &str) -> StorageResult<Option<Tree<'repo>>> {
        let dir = dir.trim_end_matches('/');
        if dir.is_empty() {
            return Ok(Some(self.tree.clone()));
        }
        let entry = match self.tree.get_path(Path::new(dir)) {
            Ok(entry) => entry,
            Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::Git(e)),
        };
        if entry.kind() != Some(ObjectType::Tree) {
            return Ok(None);
        }
        Ok(Some(repo.find_tree(entry.id())?))
    }

    /// list the entries under directory `dir`
    ///
    /// Non-recursive listings return the files directly in `dir` and its
    /// subdirectories (with a trailing `/`). Recursive listings return every
    /// file beneath `dir`. Paths are full paths from the root.
    pub fn list(&self, repo: &'repo Repository, dir: &str, recursive: bool) -> StorageResult<Vec<String>> {
        let tree = match self.subtree(repo, dir)? {
            Some(tree) => tree,
            None => return Ok(Vec::new()),
        };
        let prefix = match dir.trim_end_matches('/') {
            "" => String::new(),
            d => format!("{}/", d),
        };

        let mut out = Vec::new();
        collect_entries(repo, &tree, &prefix, recursive, &mut out)?;
        out.sort();
        Ok(out)
    }
}

fn collect_entries(
    repo: &Repository,
    tree: &Tree<'_>,
    prefix: &str,
    recursive: bool,
    out: &mut Vec<String>,
) -> StorageResult<()> {
    for entry in tree.iter() {
        let name = match entry.name() {
            Some(name) => name,
            None => continue,
        };
        match entry.kind() {
            Some(ObjectType::Blob) => out.push(format!("{}{}", prefix, name)),
            Some(ObjectType::Tree) if recursive => {
                let child = repo.find_tree(entry.id())?;
                collect_entries(repo, &child, &format!("{}{}/", prefix, name), true, out)?;
            }
            Some(ObjectType::Tree) => out.push(format!("{}{}/", prefix, name)),
            _ => {}
        }
    }
    Ok(())
}

/// a mutable tree editor for making changes
///
/// this accumulates path edits and produces a new root tree on `write`
/// the original tree is not modified
///
/// # Usage Pattern
///
/// ```ignore
/// let mut mutator = TreeMutator::from_tree(repo, &tree);
/// mutator.upsert("dir/store", blob_id)?;
/// mutator.remove("dir/store.metadata")?;
/// let new_tree_id = mutator.write()?;
/// ```
pub struct TreeMutator<'repo> {
    repo: &'repo Repository,
    /// current root, `None` once every entry has been removed
    root: Option<Oid>,
}

impl<'repo> TreeMutator<'repo> {
    /// create a new TreeMutator from an existing tree
    pub fn from_tree(repo: &'repo Repository, tree: &TreeHandle<'_>) -> Self {
        Self {
            repo,
            root: Some(tree.id().raw()),
        }
    }

    /// create a new TreeMutator for an empty tree
    pub fn empty(repo: &'repo Repository) -> Self {
        Self { repo, root: None }
    }

    /// insert or replace the blob at `path`, creating directories as needed
    pub fn upsert(&mut self, path: &str, blob: BlobId) -> StorageResult<()> {
        let segments = split_path(path)?;
        self.root = rewrite(self.repo, self.root, &segments, Some(blob.raw()))?;
        Ok(())
    }

    /// remove the blob at `path`; empty directories are pruned
    ///
    /// returns whether an entry was actually removed
    pub fn remove(&mut self, path: &str) -> StorageResult<bool> {
        let segments = split_path(path)?;
        let before = self.root;
        self.root = rewrite(self.repo, self.root, &segments, None)?;
        Ok(before != self.root)
    }

    /// write all changes and return the new root tree ID
    pub fn write(self) -> StorageResult<TreeId> {
        match self.root {
            Some(oid) => Ok(TreeId::new(oid)),
            None => Ok(TreeId::new(self.repo.treebuilder(None)?.write()?)),
        }
    }
}

fn split_path(path: &str) -> StorageResult<Vec<&str>> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Err(StorageError::Internal(format!("empty tree path: {:?}", path)));
    }
    Ok(segments)
}

/// rebuild `tree` with the entry at `segments` set to `blob` (or removed)
///
/// returns `None` when the resulting tree would be empty
fn rewrite(
    repo: &Repository,
    tree: Option<Oid>,
    segments: &[&str],
    blob: Option<Oid>,
) -> StorageResult<Option<Oid>> {
    let (head, rest) = segments
        .split_first()
        .ok_or_else(|| StorageError::Internal("empty tree path".to_string()))?;

    let existing = match tree {
        Some(id) => Some(repo.find_tree(id)?),
        None => None,
    };
    let mut builder = repo.treebuilder(existing.as_ref())?;

    let current = builder.get(*head)?.map(|entry| (entry.id(), entry.kind()));

    if rest.is_empty() {
        match blob {
            Some(id) => {
                if let Some((_, Some(ObjectType::Tree))) = current {
                    return Err(StorageError::UnexpectedEntryType {
                        path: segments.join("/").into(),
                        expected: "blob (file)".to_string(),
                        found: "tree (directory)".to_string(),
                    });
                }
                builder.insert(*head, id, FileMode::Blob.into())?;
            }
            None if current.is_none() => return Ok(tree),
            None => {
                builder.remove(*head)?;
            }
        }
    } else {
        let child = match current {
            Some((id, Some(ObjectType::Tree))) => Some(id),
            Some((_, kind)) => {
                return Err(StorageError::UnexpectedEntryType {
                    path: (*head).into(),
                    expected: "tree (directory)".to_string(),
                    found: format!("{:?}", kind),
                })
            }
            None if blob.is_none() => return Ok(tree),
            None => None,
        };
        match rewrite(repo, child, rest, blob)? {
            Some(id) => {
                builder.insert(*head, id, FileMode::Tree.into())?;
            }
            None => {
                builder.remove(*head)?;
            }
        }
    }

    if builder.len() == 0 {
        return Ok(None);
    }
    Ok(Some(builder.write()?))
}

/// helper function to create an initial empty tree
pub fn create_initial_tree(repo: &Repository) -> StorageResult<TreeId> {
    TreeMutator::empty(repo).write()
}
