//! Key-listing canonicalizer.
//!
//! A listing request is a batch of `(path, recursive)` specs. Paths ending in
//! `/` (and the root `/`) request a directory; anything else names a single
//! key. Overlapping requests are folded into the smallest equivalent set:
//!
//! ```text
//! [("dir/a/b", false), ("dir/a/", true)]  ->  [("dir/a/", true)]
//! [("dir/x", false), ("dir/", false)]     ->  [("dir/", false)]
//! ```
//!
//! The result does not depend on insertion order.

mod tree;

pub use tree::{ListSpec, NodeKind, PathTree};
