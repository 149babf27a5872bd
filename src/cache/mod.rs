//! Expiring key-value cache for application-level data.
//!
//! This module memoizes API results under namespaced keys:
//! - Stores JSON envelopes carrying the write time and an absolute expiry
//! - Treats expired and unreadable entries as misses and deletes them
//! - Reports failures as typed outcomes instead of raising
//! - Deduplicates concurrent memoized fetches for the same key

mod layer;
mod storage;
mod traits;

pub use layer::{CacheSettings, ExpiringCache, Memoized};
pub use storage::{KeyValueStore, MemoryKvStore, SqliteKvStore};
pub use traits::{CacheEnvelope, CacheStats, EvictionReport, Lookup, MissReason, StoreFailure};
