//! High-level store API.
//!
//! [`KeyStore`] ties the storage layer, the ref caches and the push
//! pipeline together. It is passed around explicitly; nothing is global.

mod api;

pub use api::{KeyStore, StoreConfig};
