//! Per-ref cache of key state and the admission path for mutations.
//!
//! Reads are served from an in-memory map filled lazily from the source.
//! Mutations are admitted synchronously (claim, permission and version
//! checks against the cache) and then queued on the store's repo writer,
//! which commits, reloads the key and publishes the new state in the same
//! critical section that releases the claim.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::cache::claims::{Claim, ClaimSet};
use crate::cache::error::{StoreError, StoreResult};
use crate::cache::fault::FaultRegister;
use crate::cache::intent::MutationIntent;
use crate::cache::store_info::StoreInfo;
use crate::cache::writer::{MutationHandle, RepoWriter};
use crate::pathtree::{ListSpec, PathTree};
use crate::storage::{has_hidden_segment, CommitId, GitSource, KeyPath, RefName, StorageError};

/// A cache entry. `Absent` records a confirmed miss so repeated lookups of a
/// missing key don't hit the repository.
#[derive(Debug, Clone)]
enum CacheSlot {
    Present(Arc<StoreInfo>),
    Absent,
}

impl CacheSlot {
    fn info(&self) -> Option<Arc<StoreInfo>> {
        match self {
            CacheSlot::Present(info) => Some(info.clone()),
            CacheSlot::Absent => None,
        }
    }
}

/// Cache and write path for one branch or tag.
///
/// Cheap to clone; clones share the same state. Tags get a read-only cache:
/// every mutation fails with [`StoreError::Unsupported`].
#[derive(Clone)]
pub struct RefCache {
    inner: Arc<RefCacheInner>,
}

struct RefCacheInner {
    reference: RefName,
    source: Arc<dyn GitSource>,
    writer: RepoWriter,
    faults: Arc<FaultRegister>,
    entries: RwLock<HashMap<KeyPath, CacheSlot>>,
    claims: ClaimSet,
    /// bumped under the entries write lock whenever the ref may have moved;
    /// a miss loaded across a bump is not cached
    generation: AtomicU64,
    /// set once the ref is found missing; the store then builds a new cache
    evicted: AtomicBool,
}

impl RefCache {
    pub fn new(reference: RefName, source: Arc<dyn GitSource>, writer: RepoWriter, faults: Arc<FaultRegister>) -> Self {
        Self {
            inner: Arc::new(RefCacheInner {
                reference,
                source,
                writer,
                faults,
                entries: RwLock::new(HashMap::new()),
                claims: ClaimSet::new(),
                generation: AtomicU64::new(0),
                evicted: AtomicBool::new(false),
            }),
        }
    }

    pub fn reference(&self) -> &RefName {
        &self.inner.reference
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.reference.is_tag()
    }

    pub fn is_evicted(&self) -> bool {
        self.inner.evicted.load(Ordering::SeqCst)
    }

    /// number of cached entries, confirmed misses included
    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// visible state of `key`
    ///
    /// Keys with a dot segment, keys whose metadata is hidden and keys
    /// beneath a hidden directory are never returned. A key without its own
    /// metadata file shows the metadata of the nearest directory that has
    /// one. Load errors are recorded as faults and read as absent.
    pub fn get(&self, key: &KeyPath) -> Option<Arc<StoreInfo>> {
        if key.is_hidden() {
            return None;
        }
        self.inner.visible(key)
    }

    /// admit `intent` and queue it on the repo writer
    ///
    /// Admission never waits: a key with an operation already in flight
    /// fails with [`StoreError::FailedToLock`]. The handle resolves with the
    /// new version once it is committed and visible through [`RefCache::get`].
    pub fn mutate(&self, intent: MutationIntent) -> StoreResult<MutationHandle> {
        let reference = &self.inner.reference;
        if reference.is_tag() {
            return Err(StoreError::Unsupported(format!("{} is read-only", reference)));
        }
        if self.is_evicted() {
            return Err(StoreError::NotFound(reference.to_string()));
        }
        check_shape(&intent)?;

        let path = intent.claim_path()?;
        let claim = self
            .inner
            .claims
            .claim(&path)
            .ok_or_else(|| StoreError::FailedToLock(path.to_string()))?;

        self.inner.admit(&intent)?;

        debug!(target: "gitkv::cache", "queued {} of {} on {}", intent.kind(), path, reference);
        let inner = self.inner.clone();
        self.inner.writer.run(move || inner.apply(intent, claim))
    }

    /// refresh every cached key from the repository
    ///
    /// Needs the whole ref: fails with [`StoreError::FailedToLock`] while
    /// any mutation is in flight. Keys that fail to refresh are dropped from
    /// the cache and reported together in [`StoreError::Reload`].
    pub fn reload_all(&self) -> StoreResult<MutationHandle<()>> {
        let claim = self
            .inner
            .claims
            .claim_ref()
            .ok_or_else(|| StoreError::FailedToLock(self.inner.reference.to_string()))?;

        let inner = self.inner.clone();
        self.inner.writer.run(move || {
            let result = inner.reload_now();
            claim.release();
            result
        })
    }

    /// refresh in place; only call from the repo writer
    pub(crate) fn reload_now(&self) -> StoreResult<()> {
        self.inner.reload_now()
    }

    /// drop every entry and mark the cache dead
    pub(crate) fn evict(&self) {
        self.inner.evict();
    }

    /// visible keys matching a batch of listing requests
    ///
    /// Requests are canonicalized first, so overlapping requests cost one
    /// repository listing. Hidden keys, metadata files and directories with
    /// hidden metadata are left out.
    pub fn list(&self, specs: &[ListSpec]) -> StoreResult<Vec<KeyPath>> {
        let tree = PathTree::from_specs(specs);
        if tree.contains_hidden() {
            debug!(target: "gitkv::cache", "listing on {} skips hidden request paths", self.inner.reference);
        }

        let mut found = BTreeSet::new();
        for spec in tree.extract() {
            if has_hidden_segment(&spec.path) {
                continue;
            }
            // e.g. a request naming a metadata file
            let path = match KeyPath::new(&spec.path) {
                Ok(path) => path,
                Err(_) => continue,
            };

            if !spec.is_directory() {
                if self.get(&path).is_some() {
                    found.insert(path);
                }
                continue;
            }

            if self.inner.directory_hidden(&path) {
                continue;
            }
            for entry in self.inner.list_source(&path, spec.recursive)? {
                if has_hidden_segment(&entry) || entry.ends_with(KeyPath::METADATA_SUFFIX) {
                    continue;
                }
                let key = match KeyPath::new(&entry) {
                    Ok(key) => key,
                    Err(_) => continue,
                };
                let visible = if key.is_directory() {
                    !self.inner.directory_hidden(&key)
                } else {
                    self.get(&key).is_some()
                };
                if visible {
                    found.insert(key);
                }
            }
        }

        Ok(found.into_iter().collect())
    }
}

impl std::fmt::Debug for RefCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefCache")
            .field("reference", &self.inner.reference)
            .field("entries", &self.len())
            .field("evicted", &self.is_evicted())
            .finish()
    }
}

/// request shape checks that need no repository access
fn check_shape(intent: &MutationIntent) -> StoreResult<()> {
    let key = match intent.key() {
        Some(key) => key,
        None => return Ok(()),
    };
    if key.is_hidden() {
        return Err(StoreError::InvalidKey(format!("{} is in the reserved namespace", key)));
    }
    match intent {
        MutationIntent::AddKey { .. } | MutationIntent::UpdateKey { .. } if key.is_directory() => {
            Err(StoreError::InvalidKey(format!("{} is a directory and holds no payload", key)))
        }
        MutationIntent::DeleteKey { .. } if key.is_directory() => {
            Err(StoreError::Unsupported(format!("deleting directory metadata {}", key)))
        }
        _ => Ok(()),
    }
}

fn version_conflict(key: &KeyPath, expected: Option<CommitId>, actual: Option<CommitId>) -> StoreError {
    StoreError::VersionConflict {
        key: key.to_string(),
        expected: expected.map(|v| v.to_string()).unwrap_or_else(|| "nothing".to_string()),
        actual: actual.map(|v| v.to_string()),
    }
}

impl RefCacheInner {
    fn load_slot(&self, key: &KeyPath) -> Result<CacheSlot, StorageError> {
        Ok(match StoreInfo::load(&self.source, key, &self.reference)? {
            Some(info) => CacheSlot::Present(Arc::new(info)),
            None => CacheSlot::Absent,
        })
    }

    /// cached state of `key`, loading it on a miss; no visibility filtering
    fn lookup(&self, key: &KeyPath) -> Option<Arc<StoreInfo>> {
        let (cached, generation) = {
            let entries = self.entries.read();
            (entries.get(key).cloned(), self.generation.load(Ordering::SeqCst))
        };
        if let Some(slot) = cached {
            return slot.info();
        }
        if self.evicted.load(Ordering::SeqCst) {
            return None;
        }

        match self.load_slot(key) {
            Ok(slot) => {
                let mut entries = self.entries.write();
                if self.generation.load(Ordering::SeqCst) != generation {
                    // the ref moved while loading; serve this read but don't keep it
                    debug!(target: "gitkv::cache", "not caching {} on {}: refreshed during load", key, self.reference);
                    return slot.info();
                }
                debug!(target: "gitkv::cache", "loaded {} on {}", key, self.reference);
                entries.entry(key.clone()).or_insert(slot).info()
            }
            Err(StorageError::RefNotFound(_)) => {
                self.evict();
                None
            }
            Err(err) => {
                self.faults
                    .record(format!("loading {} on {} failed: {}", key, self.reference, err));
                None
            }
        }
    }

    /// metadata of the directories above `key`, nearest first; directories
    /// without a metadata file are skipped
    fn directories(&self, key: &KeyPath) -> Vec<Arc<StoreInfo>> {
        let mut found = Vec::new();
        if key.as_str() == "/" {
            return found;
        }
        let mut dir = key.parent();
        loop {
            if let Some(info) = self.lookup(&dir) {
                found.push(info);
            }
            if dir.as_str() == "/" {
                return found;
            }
            dir = dir.parent();
        }
    }

    /// `key` with directory metadata applied, `None` when hidden
    fn visible(&self, key: &KeyPath) -> Option<Arc<StoreInfo>> {
        let info = self.lookup(key)?;
        let directories = self.directories(key);
        if info.metadata.hidden || directories.iter().any(|dir| dir.metadata.hidden) {
            return None;
        }
        match directories.first() {
            Some(dir) if !info.has_own_metadata() => Some(Arc::new(info.inheriting(dir))),
            _ => Some(info),
        }
    }

    /// true when directory `dir` or any directory above it is hidden
    fn directory_hidden(&self, dir: &KeyPath) -> bool {
        self.lookup(dir).is_some_and(|info| info.metadata.hidden)
            || self.directories(dir).iter().any(|info| info.metadata.hidden)
    }

    fn list_source(&self, prefix: &KeyPath, recursive: bool) -> StoreResult<Vec<String>> {
        match self.source.get_list(prefix, &self.reference, recursive) {
            Ok(entries) => Ok(entries),
            Err(StorageError::RefNotFound(reference)) => {
                self.evict();
                Err(StoreError::NotFound(reference))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// admission checks run against the cached state before queueing
    fn admit(&self, intent: &MutationIntent) -> StoreResult<()> {
        let key = match intent.key() {
            Some(key) => key,
            None => return Ok(()),
        };
        let current = self.lookup(key);
        let directories = self.directories(key);

        let author = &intent.commit().author.name;
        if current.as_ref().is_some_and(|info| !info.metadata.permits(author)) {
            return Err(StoreError::Unsupported(format!("{} is protected", key)));
        }
        if let Some(dir) = directories.iter().find(|dir| !dir.metadata.permits(author)) {
            debug!(target: "gitkv::cache", "{} denied by directory metadata {:?}", author, dir.metadata_version);
            return Err(StoreError::Unsupported(format!("{} is in a protected directory", key)));
        }

        let data_version = current.as_ref().and_then(|info| info.data_version());
        match intent {
            MutationIntent::AddKey { .. } if data_version.is_some() => Err(StoreError::AlreadyExists(key.to_string())),
            MutationIntent::UpdateKey { expected, .. } | MutationIntent::DeleteKey { expected, .. } => {
                match data_version {
                    None => Err(StoreError::NotFound(key.to_string())),
                    Some(actual) if actual != *expected => Err(version_conflict(key, Some(*expected), Some(actual))),
                    Some(_) => Ok(()),
                }
            }
            MutationIntent::UpdateMetadata { expected, .. } => {
                if !key.is_directory() && data_version.is_none() {
                    return Err(StoreError::NotFound(key.to_string()));
                }
                // the key's own metadata file, never an inherited one
                let actual = current.as_ref().and_then(|info| info.metadata_version);
                if actual != *expected {
                    return Err(version_conflict(key, *expected, actual));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// runs on the repo writer
    fn apply(&self, intent: MutationIntent, claim: Claim) -> StoreResult<CommitId> {
        let result = intent.dispatch(self.source.as_ref(), &self.reference);

        match result {
            Ok(version) => {
                self.faults.clear();
                let refreshed = intent.key().map(|key| (key, self.load_slot(key)));

                let mut entries = self.entries.write();
                self.generation.fetch_add(1, Ordering::SeqCst);
                if let Some((key, slot)) = refreshed {
                    match slot {
                        Ok(slot) => {
                            entries.insert(key.clone(), slot);
                        }
                        Err(err) => {
                            entries.remove(key);
                            self.faults
                                .record(format!("reloading {} on {} failed: {}", key, self.reference, err));
                        }
                    }
                }
                claim.release();
                drop(entries);

                info!(
                    target: "gitkv::cache",
                    "{} on {} committed as {}",
                    intent.kind(),
                    self.reference,
                    version.short()
                );
                Ok(version)
            }
            Err(err) => {
                match &err {
                    StorageError::RefNotFound(_) => self.evict(),
                    e if e.is_expected() => {
                        debug!(target: "gitkv::cache", "{} on {} refused: {}", intent.kind(), self.reference, e)
                    }
                    e => self
                        .faults
                        .record(format!("{} on {} failed: {}", intent.kind(), self.reference, e)),
                }

                // the cached state disagreed with the repository or is now unknown
                let mut entries = self.entries.write();
                self.generation.fetch_add(1, Ordering::SeqCst);
                if let Some(key) = intent.key() {
                    entries.remove(key);
                }
                claim.release();
                drop(entries);

                Err(err.into())
            }
        }
    }

    fn reload_now(&self) -> StoreResult<()> {
        let keys: Vec<KeyPath> = {
            let entries = self.entries.write();
            self.generation.fetch_add(1, Ordering::SeqCst);
            entries.keys().cloned().collect()
        };
        let mut failures = Vec::new();

        for key in keys {
            match self.load_slot(&key) {
                Ok(slot) => {
                    self.entries.write().insert(key, slot);
                }
                Err(StorageError::RefNotFound(reference)) => {
                    self.evict();
                    return Err(StoreError::NotFound(reference));
                }
                Err(err) => {
                    warn!(target: "gitkv::cache", "reload of {} on {} failed: {}", key, self.reference, err);
                    self.entries.write().remove(&key);
                    failures.push((key, err));
                }
            }
        }

        if failures.is_empty() {
            debug!(target: "gitkv::cache", "reloaded {}", self.reference);
            Ok(())
        } else {
            let err = StoreError::Reload { failures };
            self.faults.record(format!("reload of {}: {}", self.reference, err));
            Err(err)
        }
    }

    fn evict(&self) {
        let mut entries = self.entries.write();
        self.generation.fetch_add(1, Ordering::SeqCst);
        entries.clear();
        drop(entries);
        if !self.evicted.swap(true, Ordering::SeqCst) {
            info!(target: "gitkv::cache", "evicted cache of {}", self.reference);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;

    use parking_lot::Mutex;
    use tempfile::TempDir;

    use crate::storage::{
        BlobId, CommitMetadata, GitRepository, Metadata, Realm, SourceInfo, StorageResult, UserPath, UserRecord,
    };

    /// a key read parked after it has seen the repository
    struct Stall {
        key: String,
        loaded: mpsc::Sender<()>,
        resume: mpsc::Receiver<()>,
    }

    /// delegates to a repository, failing or stalling reads of selected keys
    struct FlakySource {
        repo: GitRepository,
        failing: Mutex<HashSet<String>>,
        stall: Mutex<Option<Stall>>,
        reads: AtomicUsize,
    }

    impl FlakySource {
        fn fail(&self, key: &str) {
            self.failing.lock().insert(key.to_string());
        }

        /// the next read of `key` signals once it has its result, then waits
        fn stall(&self, key: &str) -> (mpsc::Receiver<()>, mpsc::Sender<()>) {
            let (loaded_tx, loaded_rx) = mpsc::channel();
            let (resume_tx, resume_rx) = mpsc::channel();
            *self.stall.lock() = Some(Stall {
                key: key.to_string(),
                loaded: loaded_tx,
                resume: resume_rx,
            });
            (loaded_rx, resume_tx)
        }

        fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }
    }

    impl GitSource for FlakySource {
        fn get_source_info(&self, key: &KeyPath, reference: &RefName) -> StorageResult<Option<SourceInfo>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.failing.lock().contains(key.as_str()) {
                return Err(StorageError::Internal(format!("cannot read {}", key)));
            }
            let result = self.repo.get_source_info(key, reference);

            let stall = {
                let mut stall = self.stall.lock();
                match stall.as_ref() {
                    Some(s) if s.key == key.as_str() => stall.take(),
                    _ => None,
                }
            };
            if let Some(stall) = stall {
                let _ = stall.loaded.send(());
                let _ = stall.resume.recv();
            }
            result
        }
        fn read_blob(&self, blob: BlobId) -> StorageResult<Vec<u8>> {
            self.repo.read_blob(blob)
        }
        fn add_key(
            &self,
            key: &KeyPath,
            reference: &RefName,
            payload: &[u8],
            metadata: &Metadata,
            commit: &CommitMetadata,
        ) -> StorageResult<CommitId> {
            self.repo.add_key(key, reference, payload, metadata, commit)
        }
        fn modify_key(
            &self,
            key: &KeyPath,
            reference: &RefName,
            payload: &[u8],
            expected: CommitId,
            commit: &CommitMetadata,
        ) -> StorageResult<CommitId> {
            self.repo.modify_key(key, reference, payload, expected, commit)
        }
        fn delete_key(
            &self,
            key: &KeyPath,
            reference: &RefName,
            expected: CommitId,
            commit: &CommitMetadata,
        ) -> StorageResult<CommitId> {
            self.repo.delete_key(key, reference, expected, commit)
        }
        fn modify_metadata(
            &self,
            key: &KeyPath,
            reference: &RefName,
            metadata: &Metadata,
            expected: Option<CommitId>,
            commit: &CommitMetadata,
        ) -> StorageResult<CommitId> {
            self.repo.modify_metadata(key, reference, metadata, expected, commit)
        }
        fn create_ref(&self, reference: &RefName, from: &RefName) -> StorageResult<CommitId> {
            self.repo.create_ref(reference, from)
        }
        fn delete_ref(&self, reference: &RefName) -> StorageResult<()> {
            self.repo.delete_ref(reference)
        }
        fn get_list(&self, prefix: &KeyPath, reference: &RefName, recursive: bool) -> StorageResult<Vec<String>> {
            self.repo.get_list(prefix, reference, recursive)
        }
        fn get_user(&self, user: &UserPath, reference: &RefName) -> StorageResult<Option<UserRecord>> {
            self.repo.get_user(user, reference)
        }
        fn add_user(
            &self,
            user: &UserPath,
            reference: &RefName,
            record: &UserRecord,
            commit: &CommitMetadata,
        ) -> StorageResult<CommitId> {
            self.repo.add_user(user, reference, record, commit)
        }
        fn update_user(
            &self,
            user: &UserPath,
            reference: &RefName,
            record: &UserRecord,
            commit: &CommitMetadata,
        ) -> StorageResult<CommitId> {
            self.repo.update_user(user, reference, record, commit)
        }
        fn delete_user(&self, user: &UserPath, reference: &RefName, commit: &CommitMetadata) -> StorageResult<CommitId> {
            self.repo.delete_user(user, reference, commit)
        }
    }

    struct Fixture {
        _dir: TempDir,
        repo: GitRepository,
        source: Arc<FlakySource>,
        writer: RepoWriter,
        faults: Arc<FaultRegister>,
        master: RefName,
    }

    impl Fixture {
        fn new() -> Self {
            crate::test_support::init_logging();
            let dir = TempDir::new().unwrap();
            let master = RefName::new("master").unwrap();
            let repo = GitRepository::init(dir.path(), &master).unwrap();
            let source = Arc::new(FlakySource {
                repo: repo.clone(),
                failing: Mutex::new(HashSet::new()),
                stall: Mutex::new(None),
                reads: AtomicUsize::new(0),
            });
            Self {
                _dir: dir,
                repo,
                source,
                writer: RepoWriter::spawn("test-writer").unwrap(),
                faults: Arc::new(FaultRegister::new()),
                master,
            }
        }

        fn cache(&self, reference: &RefName) -> RefCache {
            RefCache::new(reference.clone(), self.source.clone(), self.writer.clone(), self.faults.clone())
        }

        fn seed(&self, key: &str, payload: &[u8], metadata: Metadata) -> CommitId {
            self.repo
                .add_key(&KeyPath::new(key).unwrap(), &self.master, payload, &metadata, &meta("seed"))
                .unwrap()
        }

        /// commit `content` at `path` on master with no metadata file, as a
        /// push would
        fn seed_raw(&self, path: &str, content: &str) -> CommitId {
            self.repo
                .with_repo(|repo| {
                    let parent = repo.find_reference(self.master.as_str())?.peel_to_commit()?;
                    let mut update = git2::build::TreeUpdateBuilder::new();
                    update.upsert(path, repo.blob(content.as_bytes())?, git2::FileMode::Blob);
                    let tree = repo.find_tree(update.create_updated(repo, &parent.tree()?)?)?;
                    let sig = git2::Signature::now("bob", "bob@example.com")?;
                    let id = repo.commit(Some(self.master.as_str()), &sig, &sig, "raw", &tree, &[&parent])?;
                    Ok(CommitId::new(id))
                })
                .unwrap()
        }

        /// park the writer until the returned sender is dropped or fired
        fn block_writer(&self) -> mpsc::Sender<()> {
            let (tx, rx) = mpsc::channel::<()>();
            self.writer
                .submit(move || {
                    let _ = rx.recv();
                })
                .unwrap();
            tx
        }
    }

    fn meta(message: &str) -> CommitMetadata {
        CommitMetadata::new("alice", "alice@example.com", message)
    }

    fn key(s: &str) -> KeyPath {
        KeyPath::new(s).unwrap()
    }

    fn update(k: &str, payload: &[u8], expected: CommitId) -> MutationIntent {
        MutationIntent::UpdateKey {
            key: key(k),
            payload: payload.to_vec(),
            expected,
            commit: meta("update"),
        }
    }

    #[tokio::test]
    async fn test_update_then_concurrent_update_fails_to_lock() {
        let fx = Fixture::new();
        let v1 = fx.seed("store", b"{}", Metadata::new().with_users(Vec::<String>::new()));
        let cache = fx.cache(&fx.master);
        assert_eq!(cache.get(&key("store")).unwrap().data_version(), Some(v1));

        let gate = fx.block_writer();
        let first = cache.mutate(update("store", b"{\"a\":1}", v1)).unwrap();
        let second = cache.mutate(update("store", b"{\"a\":2}", v1));
        assert!(matches!(second, Err(StoreError::FailedToLock(_))));
        drop(gate);

        let v2 = first.await.unwrap();
        assert_ne!(v1, v2);

        let info = cache.get(&key("store")).unwrap();
        assert_eq!(info.data_version(), Some(v2));
        assert_eq!(info.content().unwrap().read().unwrap(), b"{\"a\":1}");
    }

    #[tokio::test]
    async fn test_versions_advance_on_identical_payloads() {
        let fx = Fixture::new();
        let cache = fx.cache(&fx.master);

        let v1 = cache
            .mutate(MutationIntent::AddKey {
                key: key("a/b"),
                payload: b"same".to_vec(),
                metadata: Metadata::default(),
                commit: meta("add"),
            })
            .unwrap()
            .await
            .unwrap();
        let v2 = cache.mutate(update("a/b", b"same", v1)).unwrap().await.unwrap();
        let v3 = cache.mutate(update("a/b", b"same", v2)).unwrap().await.unwrap();

        assert_ne!(v1, v2);
        assert_ne!(v2, v3);
        assert_eq!(cache.get(&key("a/b")).unwrap().data_version(), Some(v3));
    }

    #[tokio::test]
    async fn test_stale_version_and_existence_checks() {
        let fx = Fixture::new();
        let v1 = fx.seed("k", b"1", Metadata::default());
        let cache = fx.cache(&fx.master);
        let v2 = cache.mutate(update("k", b"2", v1)).unwrap().await.unwrap();

        assert!(matches!(
            cache.mutate(update("k", b"3", v1)),
            Err(StoreError::VersionConflict { .. })
        ));
        assert!(matches!(
            cache.mutate(update("missing", b"3", v2)),
            Err(StoreError::NotFound(_))
        ));
        let add = MutationIntent::AddKey {
            key: key("k"),
            payload: b"x".to_vec(),
            metadata: Metadata::default(),
            commit: meta("add"),
        };
        assert!(matches!(cache.mutate(add), Err(StoreError::AlreadyExists(_))));

        // a failed admission releases its claim
        cache
            .mutate(MutationIntent::DeleteKey {
                key: key("k"),
                expected: v2,
                commit: meta("delete"),
            })
            .unwrap()
            .await
            .unwrap();
        assert!(cache.get(&key("k")).is_none());
        assert!(fx.faults.check_health().is_ok());
    }

    #[tokio::test]
    async fn test_stale_cache_is_dropped_after_conflict() {
        let fx = Fixture::new();
        let v1 = fx.seed("k", b"1", Metadata::default());
        let cache = fx.cache(&fx.master);
        assert!(cache.get(&key("k")).is_some());

        // written behind the cache's back
        let v2 = fx.repo.modify_key(&key("k"), &fx.master, b"2", v1, &meta("direct")).unwrap();

        let err = cache.mutate(update("k", b"3", v1)).unwrap().await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
        assert_eq!(cache.get(&key("k")).unwrap().data_version(), Some(v2));
    }

    #[tokio::test]
    async fn test_tags_are_read_only() {
        let fx = Fixture::new();
        fx.seed("k", b"1", Metadata::default());
        let tag = RefName::tag("v1").unwrap();
        fx.repo.create_ref(&tag, &fx.master).unwrap();

        let cache = fx.cache(&tag);
        assert!(cache.is_read_only());
        let v1 = cache.get(&key("k")).unwrap().data_version().unwrap();
        assert!(matches!(
            cache.mutate(update("k", b"2", v1)),
            Err(StoreError::Unsupported(_))
        ));
        assert!(cache.reload_all().unwrap().await.is_ok());
    }

    #[tokio::test]
    async fn test_protected_keys() {
        let fx = Fixture::new();
        let v1 = fx.seed("owned", b"1", Metadata::new().with_users(["alice"]).protected(true));
        let cache = fx.cache(&fx.master);

        let intent = MutationIntent::UpdateKey {
            key: key("owned"),
            payload: b"2".to_vec(),
            expected: v1,
            commit: CommitMetadata::new("bob", "bob@example.com", "steal"),
        };
        assert!(matches!(cache.mutate(intent), Err(StoreError::Unsupported(_))));
        assert!(cache.mutate(update("owned", b"2", v1)).unwrap().await.is_ok());
    }

    #[tokio::test]
    async fn test_key_shape_checks() {
        let fx = Fixture::new();
        let cache = fx.cache(&fx.master);

        let hidden = MutationIntent::AddKey {
            key: key(".secret"),
            payload: b"x".to_vec(),
            metadata: Metadata::default(),
            commit: meta("add"),
        };
        assert!(matches!(cache.mutate(hidden), Err(StoreError::InvalidKey(_))));

        let delete_dir = MutationIntent::DeleteKey {
            key: key("dir/"),
            expected: CommitId::zero(),
            commit: meta("delete"),
        };
        assert!(matches!(cache.mutate(delete_dir), Err(StoreError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_directory_metadata() {
        let fx = Fixture::new();
        let cache = fx.cache(&fx.master);

        let intent = MutationIntent::UpdateMetadata {
            key: key("dir/"),
            metadata: Metadata::new().with_content_type("text/plain"),
            expected: None,
            commit: meta("dir meta"),
        };
        let v1 = cache.mutate(intent).unwrap().await.unwrap();

        let info = cache.get(&key("dir/")).unwrap();
        assert!(info.is_metadata_only());
        assert_eq!(info.metadata_version, Some(v1));

        let stale = MutationIntent::UpdateMetadata {
            key: key("dir/"),
            metadata: Metadata::default(),
            expected: None,
            commit: meta("dir meta"),
        };
        assert!(matches!(cache.mutate(stale), Err(StoreError::VersionConflict { .. })));
    }

    #[tokio::test]
    async fn test_hidden_keys_are_invisible() {
        let fx = Fixture::new();
        fx.seed("visible", b"1", Metadata::default());
        fx.seed("masked", b"1", Metadata::new().hidden(true));
        fx.seed(".private/x", b"1", Metadata::default());
        let cache = fx.cache(&fx.master);

        assert!(cache.get(&key("visible")).is_some());
        assert!(cache.get(&key("masked")).is_none());
        assert!(cache.get(&key(".private/x")).is_none());

        let listed = cache.list(&[ListSpec::new("/", true)]).unwrap();
        assert_eq!(listed, vec![key("visible")]);

        let listed = cache.list(&[ListSpec::new(".private/", true)]).unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn test_list_canonicalizes_requests() {
        let fx = Fixture::new();
        fx.seed("dir/a/b", b"1", Metadata::default());
        fx.seed("dir/a/c", b"1", Metadata::default());
        fx.seed("dir/top", b"1", Metadata::default());
        let cache = fx.cache(&fx.master);

        let listed = cache
            .list(&[ListSpec::new("dir/a/b", false), ListSpec::new("dir/a/", true)])
            .unwrap();
        assert_eq!(listed, vec![key("dir/a/b"), key("dir/a/c")]);

        let listed = cache.list(&[ListSpec::new("dir/", false)]).unwrap();
        assert_eq!(listed, vec![key("dir/a/"), key("dir/top")]);

        let listed = cache.list(&[ListSpec::new("dir/nope", false)]).unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn test_reload_collects_failures() {
        let fx = Fixture::new();
        let va = fx.seed("a", b"1", Metadata::default());
        fx.seed("b", b"1", Metadata::default());
        fx.seed("c", b"1", Metadata::default());
        let cache = fx.cache(&fx.master);
        for k in ["a", "b", "c"] {
            assert!(cache.get(&key(k)).is_some());
        }

        let va2 = fx.repo.modify_key(&key("a"), &fx.master, b"2", va, &meta("direct")).unwrap();
        fx.source.fail("b");

        let err = cache.reload_all().unwrap().await.unwrap_err();
        match err {
            StoreError::Reload { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, key("b"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(cache.get(&key("a")).unwrap().data_version(), Some(va2));
        assert!(cache.get(&key("c")).is_some());
        assert!(fx.faults.check_health().is_err());
    }

    #[tokio::test]
    async fn test_reload_needs_whole_ref() {
        let fx = Fixture::new();
        let v1 = fx.seed("k", b"1", Metadata::default());
        let cache = fx.cache(&fx.master);

        let gate = fx.block_writer();
        let pending = cache.mutate(update("k", b"2", v1)).unwrap();
        assert!(matches!(cache.reload_all(), Err(StoreError::FailedToLock(_))));
        drop(gate);
        pending.await.unwrap();

        let gate = fx.block_writer();
        let reload = cache.reload_all().unwrap();
        assert!(matches!(
            cache.mutate(update("k", b"3", v1)),
            Err(StoreError::FailedToLock(_))
        ));
        drop(gate);
        reload.await.unwrap();
    }

    #[tokio::test]
    async fn test_load_errors_become_faults() {
        let fx = Fixture::new();
        fx.seed("k", b"1", Metadata::default());
        fx.source.fail("k");
        let cache = fx.cache(&fx.master);

        assert!(cache.get(&key("k")).is_none());
        let fault = fx.faults.check_health().unwrap_err();
        assert!(fault.message.contains("cannot read k"));
    }

    #[tokio::test]
    async fn test_missing_ref_evicts() {
        let fx = Fixture::new();
        let feature = RefName::new("feature").unwrap();
        fx.repo.create_ref(&feature, &fx.master).unwrap();
        let cache = fx.cache(&feature);
        assert!(cache.get(&key("k")).is_none());
        assert!(!cache.is_evicted());

        fx.repo.delete_ref(&feature).unwrap();
        assert!(cache.list(&[ListSpec::new("/", false)]).is_err());
        assert!(cache.is_evicted());
        assert!(cache.is_empty());
        assert!(matches!(
            cache.mutate(update("k", b"1", CommitId::zero())),
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_user_intents() {
        let fx = Fixture::new();
        let cache = fx.cache(&fx.master);
        let user = UserPath::new(Realm::Git, "bob").unwrap();

        let add = MutationIntent::AddUser {
            user: user.clone(),
            record: UserRecord::new("hash", vec![crate::storage::Role::Git]),
            commit: meta("add user"),
        };
        cache.mutate(add.clone()).unwrap().await.unwrap();
        assert!(matches!(cache.mutate(add).unwrap().await, Err(StoreError::AlreadyExists(_))));

        assert!(fx.repo.get_user(&user, &fx.master).unwrap().is_some());
        assert!(cache.get(&key(".users/git/bob")).is_none());
    }

    #[test]
    fn test_confirmed_miss_is_served_from_cache() {
        let fx = Fixture::new();
        let cache = fx.cache(&fx.master);

        assert!(cache.get(&key("missing")).is_none());
        let reads = fx.source.reads();
        assert!(reads > 0);

        assert!(cache.get(&key("missing")).is_none());
        assert!(cache.get(&key("missing")).is_none());
        assert_eq!(fx.source.reads(), reads);
    }

    #[test]
    fn test_directory_path_reads_as_absent() {
        let fx = Fixture::new();
        fx.seed("dir/x", b"1", Metadata::default());
        let cache = fx.cache(&fx.master);

        assert!(cache.get(&key("dir")).is_none());
        let reads = fx.source.reads();
        assert!(cache.get(&key("dir")).is_none());
        assert_eq!(fx.source.reads(), reads);

        assert!(cache.list(&[ListSpec::new("dir", false)]).unwrap().is_empty());
        assert!(cache.list(&[ListSpec::new("dir/x.metadata", false)]).unwrap().is_empty());
        assert!(fx.faults.check_health().is_ok());
    }

    #[tokio::test]
    async fn test_hidden_directory_hides_everything_beneath() {
        let fx = Fixture::new();
        fx.seed("dir/x", b"1", Metadata::default());
        fx.seed("dir/sub/y", b"1", Metadata::default());
        fx.seed("top", b"1", Metadata::default());
        let cache = fx.cache(&fx.master);
        assert!(cache.get(&key("dir/x")).is_some());

        cache
            .mutate(MutationIntent::UpdateMetadata {
                key: key("dir/"),
                metadata: Metadata::new().hidden(true),
                expected: None,
                commit: meta("hide dir"),
            })
            .unwrap()
            .await
            .unwrap();

        assert!(cache.get(&key("dir/x")).is_none());
        assert!(cache.get(&key("dir/sub/y")).is_none());
        assert!(cache.get(&key("dir/sub/")).is_none());
        assert!(cache.list(&[ListSpec::new("dir/", true)]).unwrap().is_empty());
        assert!(cache.list(&[ListSpec::new("dir/sub/", false)]).unwrap().is_empty());
        assert_eq!(cache.list(&[ListSpec::new("/", true)]).unwrap(), vec![key("top")]);
        assert_eq!(cache.list(&[ListSpec::new("/", false)]).unwrap(), vec![key("top")]);
    }

    #[tokio::test]
    async fn test_directory_metadata_governs_keys_without_their_own() {
        let fx = Fixture::new();
        let cache = fx.cache(&fx.master);
        let dir_version = cache
            .mutate(MutationIntent::UpdateMetadata {
                key: key("dir/"),
                metadata: Metadata::new()
                    .with_users(["alice"])
                    .protected(true)
                    .with_content_type("text/plain"),
                expected: None,
                commit: meta("protect dir"),
            })
            .unwrap()
            .await
            .unwrap();
        let raw = fx.seed_raw("dir/raw", "payload");
        cache.reload_all().unwrap().await.unwrap();

        let info = cache.get(&key("dir/raw")).unwrap();
        assert!(info.inherited);
        assert_eq!(info.data_version(), Some(raw));
        assert_eq!(info.metadata_version, Some(dir_version));
        assert_eq!(info.metadata.content_type.as_deref(), Some("text/plain"));

        let bob = CommitMetadata::new("bob", "bob@example.com", "edit");
        let update_by_bob = MutationIntent::UpdateKey {
            key: key("dir/raw"),
            payload: b"x".to_vec(),
            expected: raw,
            commit: bob.clone(),
        };
        assert!(matches!(cache.mutate(update_by_bob), Err(StoreError::Unsupported(_))));
        let add_by_bob = MutationIntent::AddKey {
            key: key("dir/new"),
            payload: b"x".to_vec(),
            metadata: Metadata::default(),
            commit: bob,
        };
        assert!(matches!(cache.mutate(add_by_bob), Err(StoreError::Unsupported(_))));

        // the key's own metadata file does not exist yet
        let own = cache
            .mutate(MutationIntent::UpdateMetadata {
                key: key("dir/raw"),
                metadata: Metadata::new().with_content_type("application/json"),
                expected: None,
                commit: meta("own metadata"),
            })
            .unwrap()
            .await
            .unwrap();
        let info = cache.get(&key("dir/raw")).unwrap();
        assert!(!info.inherited);
        assert_eq!(info.metadata_version, Some(own));
        assert_eq!(info.metadata.content_type.as_deref(), Some("application/json"));
    }

    #[test]
    fn test_miss_loaded_across_reload_is_not_kept() {
        let fx = Fixture::new();
        let v1 = fx.seed("k", b"1", Metadata::default());
        let cache = fx.cache(&fx.master);

        let (loaded, resume) = fx.source.stall("k");
        let reader = {
            let cache = cache.clone();
            thread::spawn(move || cache.get(&key("k")).and_then(|info| info.data_version()))
        };
        loaded.recv().unwrap();

        let v2 = fx.repo.modify_key(&key("k"), &fx.master, b"2", v1, &meta("direct")).unwrap();
        cache.reload_all().unwrap().wait().unwrap();
        resume.send(()).unwrap();

        // the racing read saw the old state, the cache must not keep it
        assert_eq!(reader.join().unwrap(), Some(v1));
        assert_eq!(cache.get(&key("k")).unwrap().data_version(), Some(v2));
    }

    #[test]
    fn test_miss_loaded_across_pushed_ref_move_is_not_kept() {
        let fx = Fixture::new();
        let v1 = fx.seed("k", b"1", Metadata::default());
        let incoming = RefName::new("incoming").unwrap();
        fx.repo.create_ref(&incoming, &fx.master).unwrap();
        let pushed = fx.repo.modify_key(&key("k"), &incoming, b"2", v1, &meta("pushed")).unwrap();
        let cache = fx.cache(&fx.master);

        let (loaded, resume) = fx.source.stall("k");
        let reader = {
            let cache = cache.clone();
            thread::spawn(move || cache.get(&key("k")).and_then(|info| info.data_version()))
        };
        loaded.recv().unwrap();

        // what the receive hook does once a push is validated
        let refreshed = cache.clone();
        let (repo, master) = (fx.repo.clone(), fx.master.clone());
        fx.writer
            .run_blocking(move || {
                repo.update_ref_if_unchanged(&master, v1, pushed)?;
                refreshed.reload_now()
            })
            .unwrap();
        resume.send(()).unwrap();

        assert_eq!(reader.join().unwrap(), Some(v1));
        assert_eq!(cache.get(&key("k")).unwrap().data_version(), Some(pushed));
    }
}
