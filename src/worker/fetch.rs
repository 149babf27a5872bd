//! Fetch interception: route each request to a caching strategy.

use color_eyre::Result;
use tracing::{debug, info, warn};

use super::OfflineWorker;
use crate::http::{Request, Response};

/// How a request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Not ours (cross-origin); leave it alone
  Bypass,
  /// API data: try the network, fall back to the last good response
  NetworkFirst,
  /// Static assets: serve from cache, fill from the network on a miss
  CacheFirst,
}

/// Where an intercepted response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh from the network
  Network,
  /// Static cache hit, no network round-trip
  Cache,
  /// Network unavailable, serving the last cached API response
  Offline,
  /// Network unavailable, serving the precached offline page
  OfflinePage,
  /// Network unavailable and nothing cached; a 408 stand-in
  Synthesized,
}

/// Result of intercepting one request.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
  /// The worker does not handle this request; send it straight to the network
  Passthrough,
  Response {
    response: Response,
    source: ResponseSource,
  },
  /// The mutation could not be sent and waits in the offline queue
  Queued { id: i64 },
}

impl FetchOutcome {
  fn respond(response: Response, source: ResponseSource) -> Self {
    FetchOutcome::Response { response, source }
  }

  pub fn response(&self) -> Option<&Response> {
    match self {
      FetchOutcome::Response { response, .. } => Some(response),
      _ => None,
    }
  }

  pub fn source(&self) -> Option<ResponseSource> {
    match self {
      FetchOutcome::Response { source, .. } => Some(*source),
      _ => None,
    }
  }
}

impl OfflineWorker {
  /// Pick a strategy by origin and parsed URL path.
  pub fn classify(&self, request: &Request) -> Route {
    if request.url.origin() != self.origin.origin() {
      return Route::Bypass;
    }

    let prefix = self.config.api_prefix.trim_end_matches('/');
    let path = request.url.path();
    let is_api = path == prefix
      || path
        .strip_prefix(prefix)
        .map(|rest| rest.starts_with('/'))
        .unwrap_or(false);

    if is_api {
      Route::NetworkFirst
    } else {
      Route::CacheFirst
    }
  }

  /// Handle a request the way the active worker would.
  ///
  /// Errors only when an API request fails on the network and nothing is
  /// cached for it, or a mutation fails and queuing is disabled.
  pub async fn handle_fetch(&self, request: &Request) -> Result<FetchOutcome> {
    if !self.controls_clients() {
      return Ok(FetchOutcome::Passthrough);
    }

    let route = self.classify(request);
    if route == Route::Bypass {
      return Ok(FetchOutcome::Passthrough);
    }

    if request.is_mutation() {
      return self.send_mutation(request).await;
    }

    match route {
      Route::NetworkFirst => self.network_first(request).await,
      Route::CacheFirst => self.cache_first(request).await,
      Route::Bypass => Ok(FetchOutcome::Passthrough),
    }
  }

  async fn send_mutation(&self, request: &Request) -> Result<FetchOutcome> {
    match self.network.fetch(request).await {
      Ok(response) => Ok(FetchOutcome::respond(response, ResponseSource::Network)),
      Err(e) if self.config.sync.queue_offline_mutations => {
        let id = self.queue.enqueue(request)?;
        info!(id, method = %request.method, url = %request.url, error = %e, "Queued submission for background sync");
        Ok(FetchOutcome::Queued { id })
      }
      Err(e) => Err(e),
    }
  }

  async fn network_first(&self, request: &Request) -> Result<FetchOutcome> {
    let cache_name = &self.config.caches.data_name;

    match self.network.fetch(request).await {
      Ok(response) => {
        self.store_quietly(cache_name, request, &response);
        Ok(FetchOutcome::respond(response, ResponseSource::Network))
      }
      Err(e) => match self.lookup_quietly(cache_name, request) {
        Some(cached) => {
          debug!(url = %request.url, error = %e, "Network failed, serving cached API response");
          Ok(FetchOutcome::respond(cached, ResponseSource::Offline))
        }
        None => Err(e.wrap_err(format!("No cached response for {}", request.url))),
      },
    }
  }

  async fn cache_first(&self, request: &Request) -> Result<FetchOutcome> {
    let cache_name = &self.config.caches.static_name;

    if let Some(cached) = self.lookup_quietly(cache_name, request) {
      return Ok(FetchOutcome::respond(cached, ResponseSource::Cache));
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        self.store_quietly(cache_name, request, &response);
        Ok(FetchOutcome::respond(response, ResponseSource::Network))
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "Network failed with no cached copy");

        if request.accepts_html() {
          let offline = Request::get(self.config.resolve(&self.config.offline_page)?);
          if let Some(page) = self.lookup_quietly(cache_name, &offline) {
            return Ok(FetchOutcome::respond(page, ResponseSource::OfflinePage));
          }
        }

        Ok(FetchOutcome::respond(
          Response::network_error(),
          ResponseSource::Synthesized,
        ))
      }
    }
  }

  /// Cache read that degrades to a miss on storage errors.
  fn lookup_quietly(&self, cache_name: &str, request: &Request) -> Option<Response> {
    let result = self
      .caches
      .open(cache_name)
      .and_then(|cache| cache.match_request(request));

    match result {
      Ok(found) => found,
      Err(e) => {
        warn!(cache = cache_name, url = %request.url, error = %e, "Cache lookup failed");
        None
      }
    }
  }

  /// Cache write whose failure never reaches the caller.
  fn store_quietly(&self, cache_name: &str, request: &Request, response: &Response) {
    let result = self
      .caches
      .open(cache_name)
      .and_then(|cache| cache.put(request, response));

    if let Err(e) = result {
      warn!(cache = cache_name, url = %request.url, error = %e, "Failed to cache response");
    }
  }
}
