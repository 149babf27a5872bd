//! Request and response values passed between the worker, caches and network.

use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use url::Url;

/// Header map with lowercased names.
pub type Headers = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Headers,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Headers::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// Build a request from textual method and URL.
  pub fn parse(method: &str, url: &str) -> Result<Self> {
    let method = Method::from_bytes(method.to_uppercase().as_bytes())
      .map_err(|e| eyre!("Invalid HTTP method '{}': {}", method, e))?;
    let url = Url::parse(url).map_err(|e| eyre!("Invalid URL '{}': {}", url, e))?;
    Ok(Self::new(method, url))
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_lowercase(), value.to_string());
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(&name.to_lowercase()).map(String::as_str)
  }

  /// Whether the client will take an HTML page. No `Accept` header means no.
  pub fn accepts_html(&self) -> bool {
    self
      .header("accept")
      .map(|accept| accept.contains("text/html"))
      .unwrap_or(false)
  }

  /// Anything other than GET or HEAD.
  pub fn is_mutation(&self) -> bool {
    self.method != Method::GET && self.method != Method::HEAD
  }

  /// Stable cache identity: method plus URL, ignoring any fragment.
  pub fn identity(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);

    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
  pub status: StatusCode,
  pub headers: Headers,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Headers::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_lowercase(), value.to_string());
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(&name.to_lowercase()).map(String::as_str)
  }

  /// Any 2xx status.
  pub fn is_success(&self) -> bool {
    self.status.is_success()
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  /// Stand-in returned when neither cache nor network can answer.
  pub fn network_error() -> Self {
    Self::new(StatusCode::REQUEST_TIMEOUT, "Network error happened")
      .with_header("content-type", "text/plain")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_header_names_are_case_insensitive() {
    let request = Request::get(url("http://localhost:3000/")).with_header("Accept", "text/html");
    assert_eq!(request.header("ACCEPT"), Some("text/html"));
    assert!(request.accepts_html());
  }

  #[test]
  fn test_missing_accept_is_not_html() {
    let request = Request::get(url("http://localhost:3000/logo192.png"));
    assert!(!request.accepts_html());
  }

  #[test]
  fn test_mutation_detection() {
    let base = url("http://localhost:3000/api/gardens");
    assert!(!Request::get(base.clone()).is_mutation());
    assert!(!Request::new(Method::HEAD, base.clone()).is_mutation());
    assert!(Request::new(Method::POST, base.clone()).is_mutation());
    assert!(Request::new(Method::DELETE, base).is_mutation());
  }

  #[test]
  fn test_identity_ignores_fragment_but_not_query() {
    let a = Request::get(url("http://localhost:3000/api/plants?page=1#top"));
    let b = Request::get(url("http://localhost:3000/api/plants?page=1"));
    let c = Request::get(url("http://localhost:3000/api/plants?page=2"));
    assert_eq!(a.identity(), b.identity());
    assert_ne!(b.identity(), c.identity());
  }

  #[test]
  fn test_identity_includes_method() {
    let u = url("http://localhost:3000/api/plants");
    assert_ne!(
      Request::get(u.clone()).identity(),
      Request::new(Method::HEAD, u).identity()
    );
  }

  #[test]
  fn test_parse_uppercases_method() {
    let request = Request::parse("post", "http://localhost:3000/api/gardens").unwrap();
    assert_eq!(request.method, Method::POST);
    assert!(Request::parse("GET", "not a url").is_err());
  }

  #[test]
  fn test_network_error_response() {
    let response = Response::network_error();
    assert_eq!(response.status, StatusCode::REQUEST_TIMEOUT);
    assert_eq!(response.header("Content-Type"), Some("text/plain"));
    assert_eq!(response.text(), "Network error happened");
  }
}
