//! Test doubles shared by unit tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::StatusCode;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use url::Url;

use crate::http::{Network, Request, Response};

pub const ORIGIN: &str = "http://localhost:3000";

/// Absolute URL on the test origin.
pub fn url(path: &str) -> Url {
  Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

/// Network with canned responses per URL and an offline switch.
///
/// Unknown URLs answer 404. Every call is recorded, including failed ones.
#[derive(Default)]
pub struct ScriptedNetwork {
  responses: Mutex<HashMap<String, Response>>,
  unreachable: Mutex<HashSet<String>>,
  offline: AtomicBool,
  calls: Mutex<Vec<Request>>,
}

impl ScriptedNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, url: &Url, response: Response) {
    self
      .responses
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  pub fn respond_ok(&self, url: &Url, body: &str) {
    self.respond(url, Response::new(StatusCode::OK, body));
  }

  /// Make one URL fail at the transport level.
  pub fn unreachable(&self, url: &Url) {
    self.unreachable.lock().unwrap().insert(url.to_string());
  }

  pub fn reachable(&self, url: &Url) {
    self.unreachable.lock().unwrap().remove(url.as_str());
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self) -> Vec<Request> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  pub fn clear_calls(&self) {
    self.calls.lock().unwrap().clear();
  }
}

#[async_trait]
impl Network for ScriptedNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    self.calls.lock().unwrap().push(request.clone());

    if self.offline.load(Ordering::SeqCst)
      || self.unreachable.lock().unwrap().contains(request.url.as_str())
    {
      return Err(eyre!("Failed to fetch {}: network unreachable", request.url));
    }

    let response = self
      .responses
      .lock()
      .unwrap()
      .get(request.url.as_str())
      .cloned()
      .unwrap_or_else(|| Response::new(StatusCode::NOT_FOUND, "Not Found"));

    Ok(response)
  }
}
