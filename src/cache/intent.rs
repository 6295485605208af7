//! Mutation intents: everything a caller may ask the writer to commit.

use crate::storage::{
    CommitId, CommitMetadata, GitSource, KeyPath, Metadata, RefName, StorageResult, UserPath, UserRecord,
};

/// One requested mutation of a ref.
#[derive(Debug, Clone)]
pub enum MutationIntent {
    AddKey {
        key: KeyPath,
        payload: Vec<u8>,
        metadata: Metadata,
        commit: CommitMetadata,
    },
    UpdateKey {
        key: KeyPath,
        payload: Vec<u8>,
        expected: CommitId,
        commit: CommitMetadata,
    },
    DeleteKey {
        key: KeyPath,
        expected: CommitId,
        commit: CommitMetadata,
    },
    /// `expected` is the last seen metadata version, `None` when the key
    /// had no metadata file
    UpdateMetadata {
        key: KeyPath,
        metadata: Metadata,
        expected: Option<CommitId>,
        commit: CommitMetadata,
    },
    AddUser {
        user: UserPath,
        record: UserRecord,
        commit: CommitMetadata,
    },
    UpdateUser {
        user: UserPath,
        record: UserRecord,
        commit: CommitMetadata,
    },
    DeleteUser {
        user: UserPath,
        commit: CommitMetadata,
    },
}

impl MutationIntent {
    /// short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            MutationIntent::AddKey { .. } => "add-key",
            MutationIntent::UpdateKey { .. } => "update-key",
            MutationIntent::DeleteKey { .. } => "delete-key",
            MutationIntent::UpdateMetadata { .. } => "update-metadata",
            MutationIntent::AddUser { .. } => "add-user",
            MutationIntent::UpdateUser { .. } => "update-user",
            MutationIntent::DeleteUser { .. } => "delete-user",
        }
    }

    /// the cached key this intent writes, `None` for credential writes
    pub fn key(&self) -> Option<&KeyPath> {
        match self {
            MutationIntent::AddKey { key, .. }
            | MutationIntent::UpdateKey { key, .. }
            | MutationIntent::DeleteKey { key, .. }
            | MutationIntent::UpdateMetadata { key, .. } => Some(key),
            MutationIntent::AddUser { .. } | MutationIntent::UpdateUser { .. } | MutationIntent::DeleteUser { .. } => {
                None
            }
        }
    }

    pub fn commit(&self) -> &CommitMetadata {
        match self {
            MutationIntent::AddKey { commit, .. }
            | MutationIntent::UpdateKey { commit, .. }
            | MutationIntent::DeleteKey { commit, .. }
            | MutationIntent::UpdateMetadata { commit, .. }
            | MutationIntent::AddUser { commit, .. }
            | MutationIntent::UpdateUser { commit, .. }
            | MutationIntent::DeleteUser { commit, .. } => commit,
        }
    }

    /// path claimed while the intent is in flight
    pub fn claim_path(&self) -> StorageResult<KeyPath> {
        match self {
            MutationIntent::AddKey { key, .. }
            | MutationIntent::UpdateKey { key, .. }
            | MutationIntent::DeleteKey { key, .. }
            | MutationIntent::UpdateMetadata { key, .. } => Ok(key.clone()),
            MutationIntent::AddUser { user, .. }
            | MutationIntent::UpdateUser { user, .. }
            | MutationIntent::DeleteUser { user, .. } => Ok(KeyPath::new(user.tree_path())?),
        }
    }

    /// apply the intent to `reference`
    pub(crate) fn dispatch(&self, source: &dyn GitSource, reference: &RefName) -> StorageResult<CommitId> {
        match self {
            MutationIntent::AddKey {
                key,
                payload,
                metadata,
                commit,
            } => source.add_key(key, reference, payload, metadata, commit),
            MutationIntent::UpdateKey {
                key,
                payload,
                expected,
                commit,
            } => source.modify_key(key, reference, payload, *expected, commit),
            MutationIntent::DeleteKey { key, expected, commit } => source.delete_key(key, reference, *expected, commit),
            MutationIntent::UpdateMetadata {
                key,
                metadata,
                expected,
                commit,
            } => source.modify_metadata(key, reference, metadata, *expected, commit),
            MutationIntent::AddUser { user, record, commit } => source.add_user(user, reference, record, commit),
            MutationIntent::UpdateUser { user, record, commit } => source.update_user(user, reference, record, commit),
            MutationIntent::DeleteUser { user, commit } => source.delete_user(user, reference, commit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Realm;

    fn meta() -> CommitMetadata {
        CommitMetadata::new("alice", "alice@example.com", "test")
    }

    #[test]
    fn test_claim_paths() {
        let intent = MutationIntent::DeleteKey {
            key: KeyPath::new("a/b").unwrap(),
            expected: CommitId::from_hex("0123456789012345678901234567890123456789").unwrap(),
            commit: meta(),
        };
        assert_eq!(intent.claim_path().unwrap().as_str(), "a/b");
        assert_eq!(intent.kind(), "delete-key");

        let intent = MutationIntent::DeleteUser {
            user: UserPath::new(Realm::Git, "bob").unwrap(),
            commit: meta(),
        };
        assert_eq!(intent.claim_path().unwrap().as_str(), ".users/git/bob");
        assert!(intent.key().is_none());
        assert_eq!(intent.commit().author.name, "alice");
    }
}
