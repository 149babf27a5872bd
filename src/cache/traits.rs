//! Core types for the expiring key-value cache.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The stored wrapper around cached data.
///
/// `expiry` and `timestamp` are epoch milliseconds; `expiry` is always
/// `timestamp + ttl` at write time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEnvelope {
  pub data: serde_json::Value,
  pub expiry: i64,
  pub timestamp: i64,
}

impl CacheEnvelope {
  pub fn is_expired_at(&self, now_millis: i64) -> bool {
    now_millis > self.expiry
  }
}

/// Outcome of a cache read.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
  /// Valid, unexpired data
  Hit(T),
  /// Nothing usable was found
  Miss(MissReason),
}

impl<T> Lookup<T> {
  pub fn is_hit(&self) -> bool {
    matches!(self, Lookup::Hit(_))
  }

  /// Collapse to the plain "value or nothing" view.
  pub fn into_option(self) -> Option<T> {
    match self {
      Lookup::Hit(data) => Some(data),
      Lookup::Miss(_) => None,
    }
  }

  pub fn miss_reason(&self) -> Option<MissReason> {
    match self {
      Lookup::Hit(_) => None,
      Lookup::Miss(reason) => Some(*reason),
    }
  }
}

/// Why a read did not produce data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
  /// No entry under this key
  Absent,
  /// Entry existed but its expiry had passed; it has been deleted
  Expired,
  /// Entry could not be decoded
  Corrupt,
  /// The backing store could not be read
  StorageUnavailable,
}

/// Why a cache write or delete did not happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreFailure {
  /// The value could not be serialized
  Serialization(String),
  /// The backing store rejected the operation (quota, I/O, lock)
  Storage(String),
}

impl fmt::Display for StoreFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      StoreFailure::Serialization(e) => write!(f, "failed to serialize cache value: {}", e),
      StoreFailure::Storage(e) => write!(f, "cache storage unavailable: {}", e),
    }
  }
}

impl std::error::Error for StoreFailure {}

/// Counts from an expired-entry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
  pub expired: usize,
  pub corrupt: usize,
}

impl EvictionReport {
  pub fn total(&self) -> usize {
    self.expired + self.corrupt
  }
}

/// Snapshot of the cache's contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
  pub total_items: usize,
  pub valid_items: usize,
  pub expired_items: usize,
  pub total_size_bytes: usize,
  #[serde(rename = "totalSizeKB")]
  pub total_size_kb: f64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}
