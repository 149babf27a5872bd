//! The network seam.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::HeaderMap;
use std::time::Duration;
use tracing::debug;

use super::message::{Headers, Request, Response};

/// Anything that can carry a request to its origin.
///
/// `Err` means the request never got an HTTP answer (offline, DNS, timeout).
/// Every HTTP status, including errors, comes back as `Ok`.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// reqwest-backed network.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status();
    let headers = collect_headers(response.headers());

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response body from {}: {}", request.url, e))?
      .to_vec();

    debug!(method = %request.method, url = %request.url, status = status.as_u16(), "Fetched");

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}

/// Flatten a header map, joining repeated values with ", ".
fn collect_headers(map: &HeaderMap) -> Headers {
  let mut headers = Headers::new();
  for (name, value) in map {
    let Ok(value) = value.to_str() else {
      continue;
    };
    headers
      .entry(name.as_str().to_string())
      .and_modify(|existing: &mut String| {
        existing.push_str(", ");
        existing.push_str(value);
      })
      .or_insert_with(|| value.to_string());
  }
  headers
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::header::HeaderValue;

  #[test]
  fn test_repeated_headers_are_joined() {
    let mut map = HeaderMap::new();
    map.append("vary", HeaderValue::from_static("accept"));
    map.append("vary", HeaderValue::from_static("accept-encoding"));
    map.append("set-cookie", HeaderValue::from_static("a=1"));
    map.append("set-cookie", HeaderValue::from_static("b=2"));
    map.insert("content-type", HeaderValue::from_static("application/json"));

    let headers = collect_headers(&map);

    assert_eq!(headers["vary"], "accept, accept-encoding");
    assert_eq!(headers["set-cookie"], "a=1, b=2");
    assert_eq!(headers["content-type"], "application/json");
  }

  #[test]
  fn test_non_text_header_values_are_skipped() {
    let mut map = HeaderMap::new();
    map.insert("x-binary", HeaderValue::from_bytes(b"\xff\xfe").unwrap());
    map.insert("etag", HeaderValue::from_static("\"abc\""));

    let headers = collect_headers(&map);

    assert!(!headers.contains_key("x-binary"));
    assert_eq!(headers["etag"], "\"abc\"");
  }
}
