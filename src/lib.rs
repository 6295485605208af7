//! gitkv - a Git-backed versioned key-value store
//!
//! Every key is a file in a Git repository, every write is a commit, and the
//! commit that last touched a key is its version. Writers go through the
//! in-process API (optimistic, version-checked, one commit per mutation) or
//! push commits over Git, in which case every changed key is validated
//! before the branch moves.
//!
//! # Example
//!
//! ```no_run
//! use gitkv::cache::MutationIntent;
//! use gitkv::db::{KeyStore, StoreConfig};
//! use gitkv::storage::{KeyPath, Metadata};
//!
//! # async fn run() -> Result<(), gitkv::cache::StoreError> {
//! let store = KeyStore::open(StoreConfig::new("./store"))?;
//! let master = store.default_cache()?;
//!
//! let key = KeyPath::new("config/app")?;
//! let v1 = master
//!     .mutate(MutationIntent::AddKey {
//!         key: key.clone(),
//!         payload: b"{}".to_vec(),
//!         metadata: Metadata::default(),
//!         commit: store.commit_metadata("alice", "alice@example.com", "add app config"),
//!     })?
//!     .await?;
//! assert_eq!(master.get(&key).and_then(|info| info.data_version()), Some(v1));
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod db;
pub mod pathtree;
pub mod receive;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_support {
    /// route `tracing` output to the test harness; `RUST_LOG` picks the level
    pub fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}
