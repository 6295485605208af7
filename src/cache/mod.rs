//! Ref cache and lock engine.
//!
//! Each branch or tag gets a [`RefCache`]: a map from key to the last known
//! [`StoreInfo`], filled lazily and replaced wholesale on every refresh.
//! Writes go through a single [`RepoWriter`] thread shared by all refs of a
//! store, so commits land in the order they were admitted.
//!
//! ```text
//!   caller ──mutate──► admission (claim, protect, version) ──► RepoWriter
//!                              │                                   │
//!                        FailedToLock                     commit + reload
//!                                                                  │
//!   caller ◄──handle resolves── publish + release claim ◄──────────┘
//! ```

mod claims;
mod engine;
mod error;
mod fault;
mod intent;
mod store_info;
mod writer;

pub use claims::{Claim, ClaimSet};
pub use engine::RefCache;
pub use error::{StoreError, StoreResult};
pub use fault::{Fault, FaultRegister};
pub use intent::MutationIntent;
pub use store_info::{ContentAccessor, StoreInfo, StoreKind};
pub use writer::{MutationHandle, RepoWriter};
