//! Per-ref admission claims.
//!
//! A claim marks a key as having an operation queued or running. Claims
//! never wait: either the key is free and the claim is taken, or the caller
//! gets `None` and decides how to retry.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::storage::KeyPath;

#[derive(Debug, Default)]
struct ClaimState {
    keys: HashSet<KeyPath>,
    /// ref-wide sentinel, held by whole-ref operations such as reload
    whole_ref: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ClaimTarget {
    Key(KeyPath),
    WholeRef,
}

/// The set of claimed keys of one ref.
#[derive(Debug, Clone, Default)]
pub struct ClaimSet {
    state: Arc<Mutex<ClaimState>>,
}

impl ClaimSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// claim `key`; fails if it or the ref-wide sentinel is held
    pub fn claim(&self, key: &KeyPath) -> Option<Claim> {
        let mut state = self.state.lock();
        if state.whole_ref || !state.keys.insert(key.clone()) {
            debug!(target: "gitkv::cache", "claim on {} refused", key);
            return None;
        }
        Some(Claim {
            state: self.state.clone(),
            target: ClaimTarget::Key(key.clone()),
        })
    }

    /// claim the ref-wide sentinel; fails unless nothing is claimed
    pub fn claim_ref(&self) -> Option<Claim> {
        let mut state = self.state.lock();
        if state.whole_ref || !state.keys.is_empty() {
            return None;
        }
        state.whole_ref = true;
        Some(Claim {
            state: self.state.clone(),
            target: ClaimTarget::WholeRef,
        })
    }

    pub fn is_claimed(&self, key: &KeyPath) -> bool {
        let state = self.state.lock();
        state.whole_ref || state.keys.contains(key)
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();
        !state.whole_ref && state.keys.is_empty()
    }
}

/// A held claim. Released when dropped.
#[derive(Debug)]
pub struct Claim {
    state: Arc<Mutex<ClaimState>>,
    target: ClaimTarget,
}

impl Claim {
    /// release now instead of at end of scope
    pub fn release(self) {
        drop(self)
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        match &self.target {
            ClaimTarget::Key(key) => {
                state.keys.remove(key);
            }
            ClaimTarget::WholeRef => state.whole_ref = false,
        }
    }
}
