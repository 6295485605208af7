//! storage layer for gitkv
//!
//! this module provides the Git source adapter: every key is a blob plus a
//! sibling metadata file, every mutation is a commit. The upper layers
//! (cache engine, push pipeline) use this API and never touch git2 directly.
//!
//!  # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │            GitRepository  (implements GitSource)            │
//! │     (keys, metadata, users, refs, versions, diffs)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │    tree     │       │    blob     │       │    refs     │
//!  │ (key paths) │       │ (payloads)  │       │ (branches)  │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//!         │                     │                     │
//!         └─────────────────────┼─────────────────────┘
//!                               │
//!                               ▼
//!                        ┌─────────────┐
//!                        │   commit    │
//!                        │ (versions)  │
//!                        └─────────────┘
//!  ```
//!
//! # Usage
//!
//! ```ignore
//! use gitkv::storage::{GitRepository, GitSource, KeyPath, Metadata, RefName, CommitMetadata};
//!
//! let master = RefName::new("master")?;
//! let repo = GitRepository::open_or_init("./store", &master)?;
//!
//! let key = KeyPath::new("config/app")?;
//! let meta = CommitMetadata::new("alice", "alice@example.com", "add app config");
//! let v1 = repo.add_key(&key, &master, b"{}", &Metadata::default(), &meta)?;
//! let v2 = repo.modify_key(&key, &master, b"{\"a\":1}", v1, &meta)?;
//! ```

mod blob;
mod commit;
mod document;
mod error;
mod refs;
mod repository;
mod source;
mod tree;
mod types;

// Re-export public API
pub use commit::{CommitInfo, CommitMessage, CommitMetadata};
pub use document::{Metadata, Role, UserRecord};
pub use error::{StorageError, StorageResult};
pub use repository::GitRepository;
pub use source::{GitSource, SourceInfo};
pub use types::{
    has_hidden_segment, normalize_path, BlobId, Change, ChangeStatus, CommitId, GitSignature,
    InvalidNameError, KeyPath, Realm, RefName, TreeId, UserPath,
};
