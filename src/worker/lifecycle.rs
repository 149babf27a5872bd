//! Install and activate phases.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use reqwest::StatusCode;
use tracing::{error, info};

use super::{OfflineWorker, WorkerState};
use crate::http::Request;

/// What activation cleaned up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
  /// Caches from earlier versions that were removed
  pub deleted_caches: Vec<String>,
}

impl OfflineWorker {
  /// Fetch the precache manifest into the static cache.
  ///
  /// The manifest is all-or-nothing: if any entry fails to fetch or is not a
  /// 200, nothing is stored and the worker becomes redundant.
  pub async fn install(&self) -> Result<()> {
    {
      let mut lifecycle = self.lifecycle();
      if matches!(
        lifecycle.state,
        WorkerState::Installing | WorkerState::Activating | WorkerState::Activated
      ) {
        return Err(eyre!("Cannot install while {:?}", lifecycle.state));
      }
      lifecycle.state = WorkerState::Installing;
    }

    match self.precache().await {
      Ok(count) => {
        info!(
          cache = %self.config.caches.static_name,
          count,
          "Precached assets"
        );
        let mut lifecycle = self.lifecycle();
        lifecycle.state = WorkerState::Installed;
        // Supersede any waiting version instead of waiting for a reload
        lifecycle.skip_waiting = true;
        Ok(())
      }
      Err(e) => {
        error!(error = %e, "Install failed");
        self.set_state(WorkerState::Redundant);
        Err(e)
      }
    }
  }

  async fn precache(&self) -> Result<usize> {
    let requests = self
      .config
      .precache
      .iter()
      .map(|path| self.config.resolve(path).map(Request::get))
      .collect::<Result<Vec<_>>>()?;

    let fetches = requests.into_iter().map(|request| async move {
      let response = self
        .network
        .fetch(&request)
        .await
        .map_err(|e| e.wrap_err(format!("Failed to precache {}", request.url)))?;

      if response.status != StatusCode::OK {
        return Err(eyre!(
          "Failed to precache {}: server answered {}",
          request.url,
          response.status
        ));
      }

      Ok((request, response))
    });

    let entries = try_join_all(fetches).await?;

    let cache = self.caches.open(&self.config.caches.static_name)?;
    cache.put_all(&entries)?;

    Ok(entries.len())
  }

  /// Drop caches from other versions and take control of clients.
  pub fn activate(&self) -> Result<ActivationReport> {
    {
      let mut lifecycle = self.lifecycle();
      if lifecycle.state != WorkerState::Installed {
        return Err(eyre!("Cannot activate a worker that is {:?}", lifecycle.state));
      }
      lifecycle.state = WorkerState::Activating;
    }

    match self.delete_stale_caches() {
      Ok(deleted_caches) => {
        let mut lifecycle = self.lifecycle();
        lifecycle.state = WorkerState::Activated;
        lifecycle.controls_clients = true;
        info!(deleted = deleted_caches.len(), "Worker activated");
        Ok(ActivationReport { deleted_caches })
      }
      Err(e) => {
        error!(error = %e, "Activation failed");
        self.set_state(WorkerState::Redundant);
        Err(e)
      }
    }
  }

  fn delete_stale_caches(&self) -> Result<Vec<String>> {
    let current = [
      self.config.caches.static_name.as_str(),
      self.config.caches.data_name.as_str(),
    ];

    let mut deleted = Vec::new();
    for name in self.caches.keys()? {
      if current.contains(&name.as_str()) {
        continue;
      }
      if self.caches.delete(&name)? {
        info!(cache = %name, "Deleted stale cache");
        deleted.push(name);
      }
    }

    Ok(deleted)
  }

  /// Pick up a worker that an earlier process installed and activated.
  ///
  /// Returns false (and changes nothing) when no static cache exists yet.
  pub fn resume(&self) -> Result<bool> {
    if self.state() != WorkerState::Parsed {
      return Err(eyre!("Cannot resume a worker that is {:?}", self.state()));
    }
    if !self.caches.has(&self.config.caches.static_name)? {
      return Ok(false);
    }

    let mut lifecycle = self.lifecycle();
    lifecycle.state = WorkerState::Activated;
    lifecycle.controls_clients = true;
    Ok(true)
  }

  /// Install, then activate straight away when install asked to skip waiting.
  pub async fn start(&self) -> Result<ActivationReport> {
    self.install().await?;

    if self.lifecycle().skip_waiting {
      self.activate()
    } else {
      Ok(ActivationReport::default())
    }
  }
}
