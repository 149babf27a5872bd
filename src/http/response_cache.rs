//! Named caches of whole request/response pairs, stored in SQLite.

use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, StatusCode};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::message::{Headers, Request, Response};
use crate::db::Database;

/// What happened to a response offered to a cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
  Stored,
  /// Only 200 responses are kept; nothing negative is cached
  SkippedStatus(StatusCode),
  /// Only GET requests are kept
  SkippedMethod(Method),
}

impl PutOutcome {
  pub fn is_stored(&self) -> bool {
    matches!(self, PutOutcome::Stored)
  }
}

fn cacheability(request: &Request, response: &Response) -> PutOutcome {
  if request.method != Method::GET {
    PutOutcome::SkippedMethod(request.method.clone())
  } else if response.status != StatusCode::OK {
    PutOutcome::SkippedStatus(response.status)
  } else {
    PutOutcome::Stored
  }
}

/// The set of named response caches.
#[derive(Clone)]
pub struct ResponseCache {
  db: Database,
}

impl ResponseCache {
  pub fn new(db: Database) -> Self {
    Self { db }
  }

  /// Open a cache by name, creating it if needed.
  pub fn open(&self, name: &str) -> Result<NamedCache> {
    let conn = self.db.conn()?;
    register_name(&conn, name)?;

    Ok(NamedCache {
      db: self.db.clone(),
      name: name.to_string(),
    })
  }

  /// Names of all caches, oldest first.
  pub fn keys(&self) -> Result<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_names ORDER BY created_seq")
      .map_err(|e| eyre!("Failed to prepare cache listing: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  pub fn has(&self, name: &str) -> Result<bool> {
    let conn = self.db.conn()?;
    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM cache_names WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache {}: {}", name, e))?;

    Ok(found.is_some())
  }

  /// Delete a cache and everything in it. Returns whether it existed.
  pub fn delete(&self, name: &str) -> Result<bool> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cached_responses WHERE cache_name = ?",
      params![name],
    )
    .map_err(|e| eyre!("Failed to delete responses in cache {}: {}", name, e))?;

    let removed = tx
      .execute("DELETE FROM cache_names WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    if removed > 0 {
      debug!(cache = name, "Deleted cache");
    }
    Ok(removed > 0)
  }
}

fn register_name(conn: &Connection, name: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_names (name, created_seq)
       VALUES (?, (SELECT COALESCE(MAX(created_seq), 0) + 1 FROM cache_names))",
      params![name],
    )
    .map_err(|e| eyre!("Failed to open cache {}: {}", name, e))?;
  Ok(())
}

/// Handle to one named cache.
#[derive(Clone)]
pub struct NamedCache {
  db: Database,
  name: String,
}

impl NamedCache {
  pub fn name(&self) -> &str {
    &self.name
  }

  /// The most recently stored response for this request's identity.
  pub fn match_request(&self, request: &Request) -> Result<Option<Response>> {
    let conn = self.db.conn()?;
    let row: Option<(u16, String, Vec<u8>)> = conn
      .query_row(
        "SELECT status, headers, body FROM cached_responses
         WHERE cache_name = ? AND request_key = ?",
        params![self.name, request.identity()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {} in cache {}: {}", request.url, self.name, e))?;

    let Some((status, headers, body)) = row else {
      return Ok(None);
    };

    let status = StatusCode::from_u16(status)
      .map_err(|e| eyre!("Invalid cached status {}: {}", status, e))?;
    let headers: Headers = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to parse cached headers: {}", e))?;

    Ok(Some(Response {
      status,
      headers,
      body,
    }))
  }

  /// Store a response, replacing any earlier one for the same request.
  pub fn put(&self, request: &Request, response: &Response) -> Result<PutOutcome> {
    let outcome = cacheability(request, response);
    if !outcome.is_stored() {
      debug!(cache = %self.name, url = %request.url, ?outcome, "Not caching response");
      return Ok(outcome);
    }

    let conn = self.db.conn()?;
    register_name(&conn, &self.name)?;
    insert_response(&conn, &self.name, request, response)?;

    Ok(PutOutcome::Stored)
  }

  /// Store several responses at once. Either all are stored or none are.
  pub fn put_all(&self, entries: &[(Request, Response)]) -> Result<()> {
    for (request, response) in entries {
      let outcome = cacheability(request, response);
      if !outcome.is_stored() {
        return Err(eyre!(
          "Refusing to cache {} in {}: {:?}",
          request.url,
          self.name,
          outcome
        ));
      }
    }

    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    register_name(&tx, &self.name)?;
    for (request, response) in entries {
      insert_response(&tx, &self.name, request, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  /// Remove the entry for a request. Returns whether one existed.
  pub fn delete(&self, request: &Request) -> Result<bool> {
    let conn = self.db.conn()?;
    let removed = conn
      .execute(
        "DELETE FROM cached_responses WHERE cache_name = ? AND request_key = ?",
        params![self.name, request.identity()],
      )
      .map_err(|e| eyre!("Failed to delete {} from cache {}: {}", request.url, self.name, e))?;

    Ok(removed > 0)
  }

  pub fn len(&self) -> Result<usize> {
    let conn = self.db.conn()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cached_responses WHERE cache_name = ?",
        params![self.name],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count cache {}: {}", self.name, e))?;

    Ok(count as usize)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }
}

fn insert_response(
  conn: &Connection,
  cache_name: &str,
  request: &Request,
  response: &Response,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cached_responses
         (cache_name, request_key, method, url, status, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        cache_name,
        request.identity(),
        request.method.as_str(),
        request.url.as_str(),
        response.status.as_u16(),
        headers,
        response.body,
      ],
    )
    .map_err(|e| eyre!("Failed to store {} in cache {}: {}", request.url, cache_name, e))?;

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn caches() -> ResponseCache {
    ResponseCache::new(Database::open_in_memory().unwrap())
  }

  fn get(path: &str) -> Request {
    Request::get(Url::parse("http://localhost:3000").unwrap().join(path).unwrap())
  }

  fn ok(body: &str) -> Response {
    Response::new(StatusCode::OK, body).with_header("content-type", "application/json")
  }

  #[test]
  fn test_put_and_match_round_trip() {
    let cache = caches().open("plantperfectly-data-cache-v1").unwrap();
    let response = ok(r#"[{"id":1}]"#);

    assert_eq!(cache.put(&get("/api/plants"), &response).unwrap(), PutOutcome::Stored);
    assert_eq!(cache.match_request(&get("/api/plants")).unwrap(), Some(response));
    assert_eq!(cache.match_request(&get("/api/zones")).unwrap(), None);
  }

  #[test]
  fn test_error_responses_are_never_cached() {
    let cache = caches().open("static").unwrap();

    for status in [StatusCode::NOT_FOUND, StatusCode::INTERNAL_SERVER_ERROR, StatusCode::CREATED] {
      let outcome = cache
        .put(&get("/missing.js"), &Response::new(status, "nope"))
        .unwrap();
      assert_eq!(outcome, PutOutcome::SkippedStatus(status));
    }
    assert!(cache.is_empty().unwrap());
  }

  #[test]
  fn test_error_response_does_not_replace_good_one() {
    let cache = caches().open("data").unwrap();
    cache.put(&get("/api/plants"), &ok("good")).unwrap();
    cache
      .put(&get("/api/plants"), &Response::new(StatusCode::SERVICE_UNAVAILABLE, "down"))
      .unwrap();

    let cached = cache.match_request(&get("/api/plants")).unwrap().unwrap();
    assert_eq!(cached.text(), "good");
  }

  #[test]
  fn test_only_get_requests_are_cached() {
    let cache = caches().open("data").unwrap();
    let mut post = get("/api/gardens");
    post.method = Method::POST;

    assert_eq!(
      cache.put(&post, &ok("{}")).unwrap(),
      PutOutcome::SkippedMethod(Method::POST)
    );
    assert!(cache.is_empty().unwrap());
  }

  #[test]
  fn test_last_write_wins() {
    let cache = caches().open("data").unwrap();
    cache.put(&get("/api/zones"), &ok("v1")).unwrap();
    cache.put(&get("/api/zones"), &ok("v2")).unwrap();

    assert_eq!(cache.len().unwrap(), 1);
    assert_eq!(
      cache.match_request(&get("/api/zones")).unwrap().unwrap().text(),
      "v2"
    );
  }

  #[test]
  fn test_caches_are_isolated() {
    let caches = caches();
    let a = caches.open("a").unwrap();
    let b = caches.open("b").unwrap();
    a.put(&get("/"), &ok("home")).unwrap();

    assert!(b.match_request(&get("/")).unwrap().is_none());
  }

  #[test]
  fn test_put_all_is_all_or_nothing() {
    let cache = caches().open("static").unwrap();
    let entries = vec![
      (get("/"), ok("index")),
      (get("/offline.html"), Response::new(StatusCode::NOT_FOUND, "")),
    ];

    assert!(cache.put_all(&entries).is_err());
    assert!(cache.is_empty().unwrap());

    let entries = vec![(get("/"), ok("index")), (get("/offline.html"), ok("offline"))];
    cache.put_all(&entries).unwrap();
    assert_eq!(cache.len().unwrap(), 2);
  }

  #[test]
  fn test_keys_in_creation_order_and_delete() {
    let caches = caches();
    caches.open("v1-static").unwrap();
    let data = caches.open("v1-data").unwrap();
    caches.open("v1-static").unwrap();
    data.put(&get("/api/plants"), &ok("[]")).unwrap();

    assert_eq!(caches.keys().unwrap(), vec!["v1-static", "v1-data"]);
    assert!(caches.delete("v1-data").unwrap());
    assert!(!caches.delete("v1-data").unwrap());
    assert!(!caches.has("v1-data").unwrap());
    assert!(data.match_request(&get("/api/plants")).unwrap().is_none());
  }

  #[test]
  fn test_delete_entry() {
    let cache = caches().open("static").unwrap();
    cache.put(&get("/favicon.ico"), &ok("icon")).unwrap();

    assert!(cache.delete(&get("/favicon.ico")).unwrap());
    assert!(!cache.delete(&get("/favicon.ico")).unwrap());
  }
}
