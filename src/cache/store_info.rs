//! Cached view of one key.

use std::fmt;
use std::sync::Arc;

use crate::storage::{BlobId, CommitId, GitSource, KeyPath, Metadata, RefName, StorageError, StorageResult};

/// Lazy reader for a key's payload.
#[derive(Clone)]
pub struct ContentAccessor {
    source: Arc<dyn GitSource>,
    blob: BlobId,
}

impl ContentAccessor {
    pub fn new(source: Arc<dyn GitSource>, blob: BlobId) -> Self {
        Self { source, blob }
    }

    pub fn blob(&self) -> BlobId {
        self.blob
    }

    /// read the payload bytes from the repository
    pub fn read(&self) -> StorageResult<Vec<u8>> {
        self.source.read_blob(self.blob)
    }
}

impl fmt::Debug for ContentAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentAccessor").field("blob", &self.blob).finish()
    }
}

#[derive(Debug, Clone)]
pub enum StoreKind {
    /// a key with a payload
    Key {
        data_version: CommitId,
        content: ContentAccessor,
    },
    /// directory metadata with no payload of its own
    MetadataOnly,
}

/// What the cache knows about one key on one ref.
///
/// Never mutated once published; refreshes replace the whole value.
#[derive(Debug, Clone)]
pub struct StoreInfo {
    pub kind: StoreKind,
    pub metadata_version: Option<CommitId>,
    pub metadata: Metadata,
    /// true when `metadata` came from an enclosing directory
    pub inherited: bool,
}

impl StoreInfo {
    pub fn data_version(&self) -> Option<CommitId> {
        match &self.kind {
            StoreKind::Key { data_version, .. } => Some(*data_version),
            StoreKind::MetadataOnly => None,
        }
    }

    pub fn content(&self) -> Option<&ContentAccessor> {
        match &self.kind {
            StoreKind::Key { content, .. } => Some(content),
            StoreKind::MetadataOnly => None,
        }
    }

    pub fn is_metadata_only(&self) -> bool {
        matches!(self.kind, StoreKind::MetadataOnly)
    }

    /// true when the key has a metadata file of its own
    pub fn has_own_metadata(&self) -> bool {
        self.metadata_version.is_some() && !self.inherited
    }

    /// this key seen through the metadata of directory `dir`
    pub fn inheriting(&self, dir: &StoreInfo) -> StoreInfo {
        StoreInfo {
            kind: self.kind.clone(),
            metadata_version: dir.metadata_version,
            metadata: dir.metadata.clone(),
            inherited: true,
        }
    }

    /// read the current state of `key` from the source
    pub fn load(source: &Arc<dyn GitSource>, key: &KeyPath, reference: &RefName) -> StorageResult<Option<Self>> {
        let info = match source.get_source_info(key, reference)? {
            Some(info) => info,
            None => return Ok(None),
        };

        let metadata = match info.metadata_blob {
            Some(blob) => Metadata::from_slice(&source.read_blob(blob)?)?,
            None => Metadata::default(),
        };

        let kind = match (info.data_blob, info.data_version) {
            (Some(blob), Some(data_version)) => StoreKind::Key {
                data_version,
                content: ContentAccessor::new(source.clone(), blob),
            },
            (Some(_), None) => {
                return Err(StorageError::Internal(format!("{} has a payload but no version", key)));
            }
            (None, _) => StoreKind::MetadataOnly,
        };

        Ok(Some(Self {
            kind,
            metadata_version: info.metadata_version,
            metadata,
            inherited: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CommitMetadata, GitRepository};
    use tempfile::TempDir;

    #[test]
    fn test_load_key_and_directory() {
        let dir = TempDir::new().unwrap();
        let master = RefName::new("master").unwrap();
        let repo = GitRepository::init(dir.path(), &master).unwrap();
        let source: Arc<dyn GitSource> = Arc::new(repo.clone());
        let meta = CommitMetadata::new("alice", "alice@example.com", "seed");

        let key = KeyPath::new("conf/app").unwrap();
        let v1 = repo
            .add_key(&key, &master, b"{}", &Metadata::new().with_content_type("application/json"), &meta)
            .unwrap();

        let info = StoreInfo::load(&source, &key, &master).unwrap().unwrap();
        assert_eq!(info.data_version(), Some(v1));
        assert_eq!(info.metadata_version, Some(v1));
        assert_eq!(info.metadata.content_type.as_deref(), Some("application/json"));
        assert_eq!(info.content().unwrap().read().unwrap(), b"{}");

        let dir_key = KeyPath::new("conf/").unwrap();
        assert!(StoreInfo::load(&source, &dir_key, &master).unwrap().is_none());

        repo.modify_metadata(&dir_key, &master, &Metadata::new().hidden(true), None, &meta)
            .unwrap();
        let info = StoreInfo::load(&source, &dir_key, &master).unwrap().unwrap();
        assert!(info.is_metadata_only());
        assert!(info.content().is_none());
        assert!(info.metadata.hidden);

        let key_info = StoreInfo::load(&source, &key, &master).unwrap().unwrap();
        let seen = key_info.inheriting(&info);
        assert!(seen.inherited);
        assert!(!seen.has_own_metadata());
        assert_eq!(seen.metadata_version, info.metadata_version);
        assert_eq!(seen.data_version(), Some(v1));
    }
}
