use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::CacheSettings;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin the worker serves; requests elsewhere are passed through
  pub origin: String,
  pub caches: CacheNames,
  /// Same-origin paths fetched and stored at install time
  pub precache: Vec<String>,
  /// Page served to HTML requests when both cache and network fail
  pub offline_page: String,
  /// Path prefix routed network-first (matched against the URL path only)
  pub api_prefix: String,
  pub store: StoreConfig,
  pub sync: SyncConfig,
  pub network: NetworkConfig,
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheNames {
  /// Cache for precached and cache-first assets
  pub static_name: String,
  /// Cache for network-first API responses
  pub data_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
  /// Database file (defaults to the user data directory)
  pub path: Option<PathBuf>,
  /// Prefix for expiring key-value cache entries
  pub key_prefix: String,
  pub default_ttl_ms: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Tag of the sync signal that drains the offline queue
  pub tag: String,
  /// Failed replays before a submission is dead-lettered; unset retries forever
  pub max_attempts: Option<u32>,
  /// Path probed to detect that the origin is reachable again
  pub probe_path: String,
  pub probe_interval_secs: u64,
  /// Queue mutating requests that fail for lack of network
  pub queue_offline_mutations: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default filter when RUST_LOG is unset
  pub level: String,
  /// Directory for rotated log files (defaults to the user data directory)
  pub dir: Option<PathBuf>,
}

const DEFAULT_ORIGIN: &str = "http://localhost:3000";

const DEFAULT_PRECACHE: &[&str] = &[
  "/",
  "/index.html",
  "/static/js/main.chunk.js",
  "/static/js/0.chunk.js",
  "/static/js/bundle.js",
  "/manifest.json",
  "/favicon.ico",
  "/logo192.png",
  "/logo512.png",
  "/static/css/main.chunk.css",
  "/offline.html",
];

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: DEFAULT_ORIGIN.to_string(),
      caches: CacheNames::default(),
      precache: DEFAULT_PRECACHE.iter().map(|p| p.to_string()).collect(),
      offline_page: "/offline.html".to_string(),
      api_prefix: "/api".to_string(),
      store: StoreConfig::default(),
      sync: SyncConfig::default(),
      network: NetworkConfig::default(),
      logging: LoggingConfig::default(),
    }
  }
}

impl Default for CacheNames {
  fn default() -> Self {
    Self {
      static_name: "plantperfectly-cache-v1".to_string(),
      data_name: "plantperfectly-data-cache-v1".to_string(),
    }
  }
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      path: None,
      key_prefix: "cache_".to_string(),
      default_ttl_ms: 30 * 60 * 1000,
    }
  }
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: "sync-forms".to_string(),
      max_attempts: None,
      probe_path: "/".to_string(),
      probe_interval_secs: 30,
      queue_offline_mutations: true,
    }
  }
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self { timeout_secs: 30 }
  }
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      dir: None,
    }
  }
}

/// `/path` resolves on the origin; `//host/path` would leave it.
fn is_origin_path(path: &str) -> bool {
  path.starts_with('/') && !path.starts_with("//")
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./plantcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/plantcache/config.yaml
  ///
  /// Built-in defaults are used when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("plantcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("plantcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  /// Reject settings the worker cannot run with.
  pub fn validate(&self) -> Result<()> {
    let origin = self.origin_url()?;
    if origin.cannot_be_a_base() {
      return Err(eyre!("origin must be an http(s) URL: {}", self.origin));
    }
    if self.caches.static_name == self.caches.data_name {
      return Err(eyre!(
        "Static and data caches must have different names (both are '{}')",
        self.caches.static_name
      ));
    }
    if !is_origin_path(&self.api_prefix) {
      return Err(eyre!("api_prefix must be a path on the origin: {}", self.api_prefix));
    }
    if !is_origin_path(&self.offline_page) {
      return Err(eyre!("offline_page must be a path on the origin: {}", self.offline_page));
    }
    if !is_origin_path(&self.sync.probe_path) {
      return Err(eyre!("sync.probe_path must be a path on the origin: {}", self.sync.probe_path));
    }
    if let Some(bad) = self.precache.iter().find(|p| !is_origin_path(p)) {
      return Err(eyre!("Precache entries must be same-origin paths: {}", bad));
    }
    if self.sync.probe_interval_secs == 0 {
      return Err(eyre!("sync.probe_interval_secs must be at least 1"));
    }
    if self.network.timeout_secs == 0 {
      return Err(eyre!("network.timeout_secs must be at least 1"));
    }
    if self.store.default_ttl_ms <= 0 {
      return Err(eyre!("store.default_ttl_ms must be positive"));
    }
    if self.sync.max_attempts == Some(0) {
      return Err(eyre!("sync.max_attempts must be at least 1 when set"));
    }
    Ok(())
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Resolve a same-origin path against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin_url()?
      .join(path)
      .map_err(|e| eyre!("Invalid path '{}': {}", path, e))
  }

  pub fn cache_settings(&self) -> CacheSettings {
    CacheSettings {
      key_prefix: self.store.key_prefix.clone(),
      default_ttl: Duration::milliseconds(self.store.default_ttl_ms),
    }
  }

  pub fn network_timeout(&self) -> std::time::Duration {
    std::time::Duration::from_secs(self.network.timeout_secs)
  }

  pub fn probe_interval(&self) -> std::time::Duration {
    std::time::Duration::from_secs(self.sync.probe_interval_secs)
  }

  /// Where the database lives.
  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.store.path {
      Some(path) => Ok(path.clone()),
      None => crate::db::Database::default_path(),
    }
  }

  /// Where log files go.
  pub fn log_dir(&self) -> Result<PathBuf> {
    match &self.logging.dir {
      Some(dir) => Ok(dir.clone()),
      None => {
        let data_dir = dirs::data_dir()
          .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
          .ok_or_else(|| eyre!("Could not determine data directory"))?;
        Ok(data_dir.join("plantcache").join("logs"))
      }
    }
  }
}
