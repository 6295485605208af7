//! Store API - the owner of everything a running store needs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::cache::{Fault, FaultRegister, MutationHandle, RefCache, RepoWriter, StoreError, StoreResult};
use crate::receive::{PushValidator, RefFilter};
use crate::storage::{CommitId, CommitMetadata, GitRepository, GitSource, RefName};

/// Store configuration options.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the repository directory.
    pub path: PathBuf,
    /// Create the repository if it doesn't exist.
    pub create_if_missing: bool,
    /// Branch that pushes may never delete.
    pub default_branch: String,
    /// Branch hidden from unprivileged ref advertisement.
    pub secrets_branch: Option<String>,
    /// Service account recorded as committer.
    pub proxy_user: String,
    pub proxy_email: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".gitkv"),
            create_if_missing: true,
            default_branch: "master".to_string(),
            secrets_branch: None,
            proxy_user: "gitkv".to_string(),
            proxy_email: "gitkv@localhost".to_string(),
        }
    }
}

impl StoreConfig {
    /// Create a new configuration with the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set create_if_missing flag.
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn default_branch(mut self, name: impl Into<String>) -> Self {
        self.default_branch = name.into();
        self
    }

    pub fn secrets_branch(mut self, name: impl Into<String>) -> Self {
        self.secrets_branch = Some(name.into());
        self
    }

    /// Set the committer identity.
    pub fn proxy(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.proxy_user = name.into();
        self.proxy_email = email.into();
        self
    }
}

/// The main store handle.
///
/// Cheap to clone; clones share the repository, the repo writer, the fault
/// register and the per-ref caches.
#[derive(Clone)]
pub struct KeyStore {
    inner: Arc<KeyStoreInner>,
}

struct KeyStoreInner {
    config: StoreConfig,
    default_branch: RefName,
    secrets_branch: Option<RefName>,
    repo: GitRepository,
    source: Arc<dyn GitSource>,
    writer: RepoWriter,
    faults: Arc<FaultRegister>,
    caches: RwLock<HashMap<RefName, RefCache>>,
}

impl KeyStore {
    /// Open or create a store at the given path.
    pub fn open_path(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open(StoreConfig::new(path.as_ref()))
    }

    /// Open a store with custom configuration.
    ///
    /// Staging refs left behind by an interrupted push are removed.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        let default_branch = RefName::branch(&config.default_branch)?;
        let secrets_branch = config.secrets_branch.as_deref().map(RefName::branch).transpose()?;

        let repo = if config.create_if_missing {
            GitRepository::open_or_init(&config.path, &default_branch)?
        } else if config.path.exists() {
            GitRepository::open(&config.path)?
        } else {
            return Err(StoreError::NotFound(config.path.display().to_string()));
        };

        let removed = repo.cleanup_staging_refs()?;
        if removed > 0 {
            info!(target: "gitkv::storage", "removed {} abandoned staging ref(s)", removed);
        }

        let writer = RepoWriter::spawn("gitkv-writer").map_err(crate::storage::StorageError::from)?;

        Ok(Self {
            inner: Arc::new(KeyStoreInner {
                source: Arc::new(repo.clone()),
                config,
                default_branch,
                secrets_branch,
                repo,
                writer,
                faults: Arc::new(FaultRegister::new()),
                caches: RwLock::new(HashMap::new()),
            }),
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Get the store path.
    pub fn path(&self) -> &Path {
        self.inner.repo.path()
    }

    pub fn repository(&self) -> &GitRepository {
        &self.inner.repo
    }

    pub fn default_branch(&self) -> &RefName {
        &self.inner.default_branch
    }

    pub fn faults(&self) -> &Arc<FaultRegister> {
        &self.inner.faults
    }

    pub(crate) fn writer(&self) -> &RepoWriter {
        &self.inner.writer
    }

    /// The cache of `reference`, created on first use.
    ///
    /// A cache evicted because its ref vanished is replaced by a fresh one.
    pub fn cache(&self, reference: &RefName) -> StoreResult<RefCache> {
        if let Some(cache) = self.cached(reference) {
            return Ok(cache);
        }
        if !self.inner.repo.ref_exists(reference)? {
            return Err(StoreError::NotFound(reference.to_string()));
        }

        let mut caches = self.inner.caches.write();
        if let Some(cache) = caches.get(reference).filter(|c| !c.is_evicted()) {
            return Ok(cache.clone());
        }
        let cache = RefCache::new(
            reference.clone(),
            self.inner.source.clone(),
            self.inner.writer.clone(),
            self.inner.faults.clone(),
        );
        caches.insert(reference.clone(), cache.clone());
        Ok(cache)
    }

    /// The cache of the default branch.
    pub fn default_cache(&self) -> StoreResult<RefCache> {
        self.cache(&self.inner.default_branch)
    }

    /// The cache of `reference` if one is live, without creating it.
    pub(crate) fn cached(&self, reference: &RefName) -> Option<RefCache> {
        self.inner
            .caches
            .read()
            .get(reference)
            .filter(|cache| !cache.is_evicted())
            .cloned()
    }

    /// Drop the cache of `reference`.
    pub(crate) fn evict(&self, reference: &RefName) {
        if let Some(cache) = self.inner.caches.write().remove(reference) {
            cache.evict();
        }
    }

    /// Create branch `name` at the tip of `from`, on the repo writer.
    pub fn create_branch(&self, name: &RefName, from: &RefName) -> StoreResult<MutationHandle<CommitId>> {
        if !name.is_branch() || name.is_staging() {
            return Err(StoreError::Unsupported(format!("cannot create {}", name)));
        }
        let source = self.inner.source.clone();
        let (name, from) = (name.clone(), from.clone());
        self.inner.writer.run(move || {
            let tip = source.create_ref(&name, &from)?;
            info!(target: "gitkv::storage", "created {} from {} at {}", name, from, tip.short());
            Ok(tip)
        })
    }

    /// Commit metadata for a write on behalf of `author`, committed by the
    /// configured proxy user.
    pub fn commit_metadata(
        &self,
        author: impl Into<String>,
        email: impl Into<String>,
        message: impl Into<String>,
    ) -> CommitMetadata {
        let config = &self.inner.config;
        CommitMetadata::new(author, email, message).proxy(&config.proxy_user, &config.proxy_email)
    }

    /// Take the last unexpected error, if any.
    pub fn check_health(&self) -> Result<(), Fault> {
        self.inner.faults.check_health()
    }

    /// Pre-receive hook for pushes to this store.
    pub fn validator(&self) -> PushValidator {
        PushValidator::new(self.clone())
    }

    /// Ref advertisement filter for this store.
    pub fn ref_filter(&self) -> RefFilter {
        RefFilter::new(self.inner.secrets_branch.clone())
    }

    /// Refs a client may see.
    pub fn advertised_refs(&self, privileged: bool) -> StoreResult<Vec<RefName>> {
        let refs = self.inner.repo.list_refs("refs/")?;
        Ok(self.ref_filter().advertise(refs, privileged))
    }
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("path", &self.path())
            .field("default_branch", &self.inner.default_branch)
            .finish()
    }
}
