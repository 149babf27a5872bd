//! The offline worker: request routing, precache lifecycle and background sync.
//!
//! One `OfflineWorker` owns the named response caches, the offline queue and
//! the network handle for a given origin. Nothing is global, so several
//! workers over separate databases can run side by side.

mod events;
mod fetch;
mod lifecycle;
mod sync;

pub use events::{ConnectivityMonitor, WorkerEvent};
pub use fetch::{FetchOutcome, ResponseSource, Route};
pub use lifecycle::ActivationReport;
pub use sync::SyncReport;

use color_eyre::Result;
use std::sync::{Arc, Mutex, MutexGuard};
use url::Url;

use crate::config::Config;
use crate::db::Database;
use crate::http::{Network, ResponseCache};
use crate::queue::OfflineQueue;

/// Where the worker is in its install/activate lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Constructed, nothing precached yet
  Parsed,
  Installing,
  /// Precache complete, waiting to activate
  Installed,
  Activating,
  /// Controlling clients and intercepting fetches
  Activated,
  /// Install or activation failed
  Redundant,
}

#[derive(Debug)]
struct Lifecycle {
  state: WorkerState,
  /// Activate as soon as install completes
  skip_waiting: bool,
  controls_clients: bool,
}

pub struct OfflineWorker {
  config: Arc<Config>,
  origin: Url,
  network: Arc<dyn Network>,
  caches: ResponseCache,
  queue: OfflineQueue,
  lifecycle: Mutex<Lifecycle>,
}

impl OfflineWorker {
  pub fn new(config: Config, db: Database, network: Arc<dyn Network>) -> Result<Self> {
    config.validate()?;
    let origin = config.origin_url()?;

    Ok(Self {
      config: Arc::new(config),
      origin,
      network,
      caches: ResponseCache::new(db.clone()),
      queue: OfflineQueue::new(db),
      lifecycle: Mutex::new(Lifecycle {
        state: WorkerState::Parsed,
        skip_waiting: false,
        controls_clients: false,
      }),
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn network(&self) -> &Arc<dyn Network> {
    &self.network
  }

  pub fn caches(&self) -> &ResponseCache {
    &self.caches
  }

  pub fn queue(&self) -> &OfflineQueue {
    &self.queue
  }

  pub fn state(&self) -> WorkerState {
    self.lifecycle().state
  }

  /// Whether fetches are being intercepted. Only an activated worker does.
  pub fn controls_clients(&self) -> bool {
    let lifecycle = self.lifecycle();
    lifecycle.controls_clients && lifecycle.state == WorkerState::Activated
  }

  fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
    // State is plain data; a panic elsewhere cannot leave it half-written
    self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn set_state(&self, state: WorkerState) {
    let mut lifecycle = self.lifecycle();
    lifecycle.state = state;
    if state == WorkerState::Redundant {
      lifecycle.controls_clients = false;
      lifecycle.skip_waiting = false;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::ScriptedNetwork;

  #[test]
  fn test_new_worker_starts_parsed() {
    let worker = OfflineWorker::new(
      Config::default(),
      Database::open_in_memory().unwrap(),
      Arc::new(ScriptedNetwork::new()),
    )
    .unwrap();

    assert_eq!(worker.state(), WorkerState::Parsed);
    assert!(!worker.controls_clients());
  }

  #[test]
  fn test_new_worker_rejects_invalid_config() {
    let mut config = Config::default();
    config.caches.data_name = config.caches.static_name.clone();

    let result = OfflineWorker::new(
      config,
      Database::open_in_memory().unwrap(),
      Arc::new(ScriptedNetwork::new()),
    );
    assert!(result.is_err());
  }

  #[test]
  fn test_workers_are_isolated() {
    let a = OfflineWorker::new(
      Config::default(),
      Database::open_in_memory().unwrap(),
      Arc::new(ScriptedNetwork::new()),
    )
    .unwrap();
    let b = OfflineWorker::new(
      Config::default(),
      Database::open_in_memory().unwrap(),
      Arc::new(ScriptedNetwork::new()),
    )
    .unwrap();

    a.caches().open("plantperfectly-cache-v1").unwrap();
    assert!(b.caches().keys().unwrap().is_empty());
  }
}
