//! SQLite-backed local persistence.

pub mod offline_store;

pub use offline_store::{CacheStatus, CachedJobRecord, OfflineStore};
