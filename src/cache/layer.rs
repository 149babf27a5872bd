//! Expiring cache layer over a persistent string store.

use chrono::Duration;
use color_eyre::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

use super::storage::KeyValueStore;
use super::traits::{CacheEnvelope, CacheStats, EvictionReport, Lookup, MissReason, StoreFailure};
use crate::clock::{Clock, SystemClock};

/// Namespace and default lifetime for cached entries.
#[derive(Debug, Clone)]
pub struct CacheSettings {
  /// Prefix separating cache entries from other keys in the shared store
  pub key_prefix: String,
  /// Lifetime used when a write does not name one
  pub default_ttl: Duration,
}

impl Default for CacheSettings {
  fn default() -> Self {
    Self {
      key_prefix: "cache_".to_string(),
      default_ttl: Duration::minutes(30),
    }
  }
}

type InflightMap = HashMap<String, Arc<tokio::sync::Mutex<()>>>;

/// Key-value cache storing JSON envelopes with an expiry.
///
/// Every read revalidates expiry, so a late or duplicate write is wasted work
/// rather than a correctness problem.
pub struct ExpiringCache<S: KeyValueStore> {
  store: Arc<S>,
  settings: Arc<CacheSettings>,
  clock: Arc<dyn Clock>,
  /// Per-key locks held while a memoized fetch is running
  inflight: Arc<Mutex<InflightMap>>,
}

impl<S: KeyValueStore> ExpiringCache<S> {
  /// Create a new cache over the given store.
  pub fn new(store: S, settings: CacheSettings) -> Self {
    Self {
      store: Arc::new(store),
      settings: Arc::new(settings),
      clock: Arc::new(SystemClock),
      inflight: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  /// Use a different time source.
  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// The underlying store.
  pub fn store(&self) -> &S {
    &self.store
  }

  pub fn settings(&self) -> &CacheSettings {
    &self.settings
  }

  /// Full storage key for a cache key.
  pub fn namespaced(&self, key: &str) -> String {
    format!("{}{}", self.settings.key_prefix, key)
  }

  fn cache_keys(&self) -> Result<Vec<String>> {
    let keys = self.store.keys()?;
    Ok(
      keys
        .into_iter()
        .filter(|k| k.starts_with(&self.settings.key_prefix))
        .collect(),
    )
  }

  /// Store a value for `ttl` (or the default lifetime).
  pub fn put<T: Serialize + ?Sized>(
    &self,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
  ) -> Result<(), StoreFailure> {
    let ttl = ttl.unwrap_or(self.settings.default_ttl);
    let now = self.clock.now_millis();

    let data = serde_json::to_value(value).map_err(|e| {
      error!(key, error = %e, "Error caching data");
      StoreFailure::Serialization(e.to_string())
    })?;

    let envelope = CacheEnvelope {
      data,
      // Lifetimes past the end of time never expire
      expiry: now.saturating_add(ttl.num_milliseconds()),
      timestamp: now,
    };

    let raw = serde_json::to_string(&envelope).map_err(|e| {
      error!(key, error = %e, "Error caching data");
      StoreFailure::Serialization(e.to_string())
    })?;

    self.store.set(&self.namespaced(key), &raw).map_err(|e| {
      error!(key, error = %e, "Error caching data");
      StoreFailure::Storage(e.to_string())
    })
  }

  /// Read a value, treating expired and unreadable entries as misses.
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Lookup<T> {
    let full_key = self.namespaced(key);

    let raw = match self.store.get(&full_key) {
      Ok(Some(raw)) => raw,
      Ok(None) => return Lookup::Miss(MissReason::Absent),
      Err(e) => {
        error!(key, error = %e, "Error retrieving cached data");
        return Lookup::Miss(MissReason::StorageUnavailable);
      }
    };

    let envelope: CacheEnvelope = match serde_json::from_str(&raw) {
      Ok(envelope) => envelope,
      Err(e) => {
        warn!(key, error = %e, "Discarding unreadable cache entry");
        self.remove_quietly(&full_key);
        return Lookup::Miss(MissReason::Corrupt);
      }
    };

    if envelope.is_expired_at(self.clock.now_millis()) {
      debug!(key, "Cache entry expired");
      self.remove_quietly(&full_key);
      return Lookup::Miss(MissReason::Expired);
    }

    // A shape mismatch is the caller's problem, not the entry's
    match serde_json::from_value(envelope.data) {
      Ok(data) => Lookup::Hit(data),
      Err(e) => {
        warn!(key, error = %e, "Cached data does not match requested type");
        Lookup::Miss(MissReason::Corrupt)
      }
    }
  }

  fn remove_quietly(&self, full_key: &str) {
    if let Err(e) = self.store.remove(full_key) {
      error!(key = full_key, error = %e, "Error removing cache entry");
    }
  }

  /// Delete one entry. Deleting a missing key succeeds.
  pub fn invalidate(&self, key: &str) -> Result<(), StoreFailure> {
    self.store.remove(&self.namespaced(key)).map_err(|e| {
      error!(key, error = %e, "Error clearing cache");
      StoreFailure::Storage(e.to_string())
    })
  }

  /// Delete every cache entry, leaving foreign keys alone.
  pub fn invalidate_all(&self) -> Result<usize, StoreFailure> {
    let result: Result<usize> = (|| {
      let keys = self.cache_keys()?;
      for key in &keys {
        self.store.remove(key)?;
      }
      Ok(keys.len())
    })();

    result.map_err(|e| {
      error!(error = %e, "Error clearing all cache");
      StoreFailure::Storage(e.to_string())
    })
  }

  /// Delete expired and unreadable entries.
  pub fn evict_expired(&self) -> Result<EvictionReport, StoreFailure> {
    let result: Result<EvictionReport> = (|| {
      let now = self.clock.now_millis();
      let mut report = EvictionReport::default();

      for key in self.cache_keys()? {
        let Some(raw) = self.store.get(&key)? else {
          continue;
        };

        match serde_json::from_str::<CacheEnvelope>(&raw) {
          Ok(envelope) if envelope.is_expired_at(now) => {
            self.store.remove(&key)?;
            report.expired += 1;
          }
          Ok(_) => {}
          Err(_) => {
            self.store.remove(&key)?;
            report.corrupt += 1;
          }
        }
      }

      Ok(report)
    })();

    match result {
      Ok(report) => {
        if report.total() > 0 {
          debug!(
            expired = report.expired,
            corrupt = report.corrupt,
            "Evicted cache entries"
          );
        }
        Ok(report)
      }
      Err(e) => {
        error!(error = %e, "Error clearing expired cache");
        Err(StoreFailure::Storage(e.to_string()))
      }
    }
  }

  /// Count and size every cache entry.
  pub fn stats(&self) -> CacheStats {
    match self.scan_stats() {
      Ok(stats) => stats,
      Err(e) => {
        error!(error = %e, "Error getting cache stats");
        CacheStats {
          error: Some(e.to_string()),
          ..CacheStats::default()
        }
      }
    }
  }

  fn scan_stats(&self) -> Result<CacheStats> {
    let now = self.clock.now_millis();
    let keys = self.cache_keys()?;
    let mut stats = CacheStats {
      total_items: keys.len(),
      ..CacheStats::default()
    };

    for key in &keys {
      let raw = self.store.get(key)?.unwrap_or_default();
      stats.total_size_bytes += raw.len();

      match serde_json::from_str::<CacheEnvelope>(&raw) {
        Ok(envelope) if !envelope.is_expired_at(now) => stats.valid_items += 1,
        _ => stats.expired_items += 1,
      }
    }

    stats.total_size_kb = (stats.total_size_bytes as f64 / 1024.0 * 100.0).round() / 100.0;
    Ok(stats)
  }

  /// Return the cached value for `key`, or run `fetcher` and cache its result.
  ///
  /// Concurrent misses on the same key share one `fetcher` call: later
  /// callers wait for the first and then read what it stored. Errors from
  /// `fetcher` are returned as-is and nothing is cached.
  pub async fn memoize<T, F, Fut>(&self, key: &str, ttl: Option<Duration>, fetcher: F) -> Result<T>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    if let Lookup::Hit(data) = self.get::<T>(key) {
      return Ok(data);
    }

    let slot = self.inflight_slot(key);
    let result = {
      let _guard = slot.lock().await;
      self.fill(key, ttl, fetcher).await
    };
    self.release_slot(key, slot);

    result
  }

  async fn fill<T, F, Fut>(&self, key: &str, ttl: Option<Duration>, fetcher: F) -> Result<T>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    // Another caller may have filled the entry while we waited
    if let Lookup::Hit(data) = self.get::<T>(key) {
      return Ok(data);
    }

    let data = fetcher().await?;
    // Failure is already logged; the caller still gets fresh data
    let _ = self.put(key, &data, ttl);

    Ok(data)
  }

  fn inflight_slot(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
    let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
    Arc::clone(inflight.entry(key.to_string()).or_default())
  }

  fn release_slot(&self, key: &str, slot: Arc<tokio::sync::Mutex<()>>) {
    let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
    // Only the registry and this caller still hold it
    if Arc::strong_count(&slot) == 2 {
      inflight.remove(key);
    }
  }

  /// Wrap `fetcher` so each call goes through [`ExpiringCache::memoize`].
  pub fn memoized<F>(&self, key: &str, ttl: Option<Duration>, fetcher: F) -> Memoized<S, F> {
    Memoized {
      cache: self.clone(),
      key: key.to_string(),
      ttl,
      fetcher,
    }
  }
}

impl<S: KeyValueStore> Clone for ExpiringCache<S> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      settings: Arc::clone(&self.settings),
      clock: Arc::clone(&self.clock),
      inflight: Arc::clone(&self.inflight),
    }
  }
}

/// A fetch function bound to a cache key.
pub struct Memoized<S: KeyValueStore, F> {
  cache: ExpiringCache<S>,
  key: String,
  ttl: Option<Duration>,
  fetcher: F,
}

impl<S: KeyValueStore, F> Memoized<S, F> {
  pub async fn call<T, Fut>(&self) -> Result<T>
  where
    T: Serialize + DeserializeOwned,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    self
      .cache
      .memoize(&self.key, self.ttl, || (self.fetcher)())
      .await
  }
}
