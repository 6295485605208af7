//! Push validation pipeline.
//!
//! Git clients write to the store by pushing. Before a pushed branch moves,
//! every file changed by the push is checked: metadata and credential files
//! must parse, credential files must sit in a known realm, and every object
//! must have been received. A single bad file rejects the whole branch with
//! `Error in branch <ref>` and leaves the ref untouched.

mod advertise;
mod hook;
mod validate;

pub use advertise::RefFilter;
pub use hook::{CommandResult, PushState, PushValidator, ReceiveCommand};
pub use validate::{validate_push, ValidationError};
