//! Pre-receive processing of pushed ref updates.
//!
//! Each command moves through
//!
//! ```text
//! Received ──► Staged ──► Validated ──► Applied
//!    │            │
//!    └────────────┴──────► Rejected
//! ```
//!
//! The proposed tip is parked on a private staging ref while its content is
//! checked, so the real ref only ever moves to fully validated commits. The
//! staging ref is removed whatever the outcome.
//!
//! Only branches are pushable. Tags are read-only and get their own
//! rejection message; any other ref is rejected as `Error in branch <ref>`.

use tracing::{info, warn};

use crate::cache::{StoreError, StoreResult};
use crate::db::KeyStore;
use crate::receive::validate::validate_push;
use crate::storage::{CommitId, GitSource, RefName};

/// Outcome reported back to the pushing client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    NotAttempted,
    Ok,
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
    Received,
    Staged,
    Validated,
    Applied,
    Rejected,
}

/// One ref update of a push. A zero `old` creates the ref, a zero `new`
/// deletes it.
#[derive(Debug, Clone)]
pub struct ReceiveCommand {
    pub old: CommitId,
    pub new: CommitId,
    pub ref_name: RefName,
    result: CommandResult,
    state: PushState,
}

impl ReceiveCommand {
    pub fn new(old: CommitId, new: CommitId, ref_name: RefName) -> Self {
        Self {
            old,
            new,
            ref_name,
            result: CommandResult::NotAttempted,
            state: PushState::Received,
        }
    }

    pub fn is_create(&self) -> bool {
        self.old.is_zero()
    }

    pub fn is_delete(&self) -> bool {
        self.new.is_zero()
    }

    pub fn result(&self) -> &CommandResult {
        &self.result
    }

    pub fn state(&self) -> PushState {
        self.state
    }

    fn reject(&mut self, message: String) {
        warn!(target: "gitkv::receive", "rejected {}: {}", self.ref_name, message);
        self.result = CommandResult::Rejected(message);
        self.state = PushState::Rejected;
    }

    fn reject_branch(&mut self) {
        let message = format!("Error in branch {}", self.ref_name);
        self.reject(message);
    }

    fn accept(&mut self) {
        self.result = CommandResult::Ok;
        self.state = PushState::Applied;
    }
}

/// The pre-receive hook of a store.
#[derive(Debug, Clone)]
pub struct PushValidator {
    store: KeyStore,
}

impl PushValidator {
    pub(crate) fn new(store: KeyStore) -> Self {
        Self { store }
    }

    /// Validate and apply every command, recording each outcome on the
    /// command itself. Commands are independent: one rejected branch does
    /// not affect the others.
    ///
    /// Blocks the calling thread while the repo writer applies updates.
    pub fn pre_receive(&self, commands: &mut [ReceiveCommand]) {
        for command in commands.iter_mut() {
            self.process(command);
        }
    }

    fn process(&self, command: &mut ReceiveCommand) {
        let reference = command.ref_name.clone();

        if command.is_delete() && &reference == self.store.default_branch() {
            command.reject(format!("refusing to delete the default branch {}", reference));
            return;
        }
        if reference.is_tag() {
            command.reject(format!("tag {} is read-only", reference));
            return;
        }
        if !reference.is_branch() || reference.is_staging() {
            command.reject_branch();
            return;
        }

        let current = match self.store.repository().try_resolve(&reference) {
            Ok(current) => current,
            Err(err) => {
                self.store
                    .faults()
                    .record(format!("reading {} during push failed: {}", reference, err));
                command.reject(err.to_string());
                return;
            }
        };
        let expected = if command.is_create() { None } else { Some(command.old) };
        if current != expected {
            warn!(target: "gitkv::receive", "{} moved since the push started", reference);
            command.reject_branch();
            return;
        }

        let outcome = if command.is_delete() {
            self.apply_delete(command)
        } else {
            self.stage(command)
        };
        if let Err(err) = outcome {
            self.store
                .faults()
                .record(format!("push to {} failed: {}", reference, err));
            command.reject(format!("internal error in branch {}", reference));
        }
    }

    fn stage(&self, command: &mut ReceiveCommand) -> StoreResult<()> {
        let repo = self.store.repository();
        if !repo.has_commit(command.new)? {
            warn!(target: "gitkv::receive", "{}: commit {} was not received", command.ref_name, command.new);
            command.reject_branch();
            return Ok(());
        }

        let staging = repo.create_staging_ref(command.new)?;
        command.state = PushState::Staged;

        let outcome = self.validate_and_apply(command);
        self.discard_staging(&staging, outcome)
    }

    /// remove `staging`, passing `outcome` through; a failed removal is
    /// recorded as a fault
    fn discard_staging(&self, staging: &RefName, outcome: StoreResult<()>) -> StoreResult<()> {
        if let Err(err) = self.store.repository().delete_ref(staging) {
            self.store
                .faults()
                .record(format!("removing {} failed: {}", staging, err));
        }
        outcome
    }

    fn validate_and_apply(&self, command: &mut ReceiveCommand) -> StoreResult<()> {
        let old = if command.is_create() { None } else { Some(command.old) };
        let problems = validate_push(self.store.repository(), old, command.new)?;
        if !problems.is_empty() {
            for problem in &problems {
                warn!(target: "gitkv::receive", "{}: {}", command.ref_name, problem);
            }
            command.reject_branch();
            return Ok(());
        }
        command.state = PushState::Validated;

        let store = self.store.clone();
        let (reference, new) = (command.ref_name.clone(), command.new);
        let applied = self.store.writer().run_blocking(move || {
            let repo = store.repository();
            match old {
                None => repo.create_ref_at(&reference, new)?,
                Some(old) => repo.update_ref_if_unchanged(&reference, old, new)?,
            }
            store.faults().clear();
            if let Some(cache) = store.cached(&reference) {
                // the ref has moved; a failed refresh is already a fault
                if let Err(err) = cache.reload_now() {
                    warn!(target: "gitkv::receive", "refreshing {} after push failed: {}", reference, err);
                }
            }
            Ok(())
        });

        match applied {
            Ok(()) => {
                info!(target: "gitkv::receive", "{} moved to {}", command.ref_name, command.new.short());
                command.accept();
                Ok(())
            }
            Err(err @ (StoreError::AlreadyExists(_) | StoreError::VersionConflict { .. })) => {
                warn!(target: "gitkv::receive", "{}: {}", command.ref_name, err);
                command.reject_branch();
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn apply_delete(&self, command: &mut ReceiveCommand) -> StoreResult<()> {
        let store = self.store.clone();
        let reference = command.ref_name.clone();
        self.store.writer().run_blocking(move || {
            store.repository().delete_ref(&reference)?;
            store.faults().clear();
            store.evict(&reference);
            Ok(())
        })?;

        info!(target: "gitkv::receive", "deleted {}", command.ref_name);
        command.accept();
        Ok(())
    }
}
