//! Durable queue of form submissions that could not reach the server.
//!
//! Records are appended when a mutating request fails for lack of network,
//! replayed by the background sync pass, and deleted once the server accepts
//! them. Retry counts are kept beside the record so a failed replay leaves
//! the record itself untouched.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, warn};

use crate::db::Database;
use crate::http::{Headers, Request};

/// A queued submission, exactly as it was captured.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedSubmission {
  pub id: i64,
  pub url: String,
  pub method: String,
  pub headers: Headers,
  pub body: Option<Vec<u8>>,
}

impl QueuedSubmission {
  /// Rebuild the original request for replay.
  pub fn to_request(&self) -> Result<Request> {
    let mut request = Request::parse(&self.method, &self.url)?;
    request.headers = self.headers.clone();
    request.body = self.body.clone();
    Ok(request)
  }

  fn from_row(row: &Row<'_>) -> rusqlite::Result<(i64, String, String, String, Option<Vec<u8>>)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
  }

  fn decode(
    (id, url, method, headers, body): (i64, String, String, String, Option<Vec<u8>>),
  ) -> Result<Self> {
    let headers: Headers = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to parse headers of queued submission {}: {}", id, e))?;

    Ok(Self {
      id,
      url,
      method,
      headers,
      body,
    })
  }
}

/// A submission that was given up on.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
  pub submission: QueuedSubmission,
  pub attempts: u32,
  pub last_error: Option<String>,
}

#[derive(Clone)]
pub struct OfflineQueue {
  db: Database,
}

impl OfflineQueue {
  pub fn new(db: Database) -> Self {
    Self { db }
  }

  /// Append a request. Returns its id.
  pub fn enqueue(&self, request: &Request) -> Result<i64> {
    let headers = serde_json::to_string(&request.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT INTO offline_forms (url, method, headers, body) VALUES (?, ?, ?, ?)",
        params![
          request.url.as_str(),
          request.method.as_str(),
          headers,
          request.body
        ],
      )
      .map_err(|e| eyre!("Failed to queue submission to {}: {}", request.url, e))?;

    let id = conn.last_insert_rowid();
    debug!(id, url = %request.url, "Queued offline submission");
    Ok(id)
  }

  /// Every queued submission, oldest first.
  pub fn all(&self) -> Result<Vec<QueuedSubmission>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT id, url, method, headers, body FROM offline_forms ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare queue listing: {}", e))?;

    let rows = stmt
      .query_map([], QueuedSubmission::from_row)
      .map_err(|e| eyre!("Failed to list queued submissions: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read queued submission: {}", e))?;

    rows.into_iter().map(QueuedSubmission::decode).collect()
  }

  pub fn get(&self, id: i64) -> Result<Option<QueuedSubmission>> {
    let conn = self.db.conn()?;
    let row = conn
      .query_row(
        "SELECT id, url, method, headers, body FROM offline_forms WHERE id = ?",
        params![id],
        QueuedSubmission::from_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to read queued submission {}: {}", id, e))?;

    row.map(QueuedSubmission::decode).transpose()
  }

  /// Remove a submission and its retry bookkeeping. Returns whether it existed.
  pub fn delete(&self, id: i64) -> Result<bool> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let removed = tx
      .execute("DELETE FROM offline_forms WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete queued submission {}: {}", id, e))?;
    tx.execute("DELETE FROM replay_attempts WHERE form_id = ?", params![id])
      .map_err(|e| eyre!("Failed to clear attempts for {}: {}", id, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  pub fn len(&self) -> Result<usize> {
    let conn = self.db.conn()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM offline_forms", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count queued submissions: {}", e))?;
    Ok(count as usize)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  /// Note a failed replay. Returns the attempt count so far.
  pub fn record_failure(&self, id: i64, reason: &str) -> Result<u32> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT INTO replay_attempts (form_id, attempts, last_error, last_attempt_at)
         VALUES (?, 1, ?, datetime('now'))
         ON CONFLICT(form_id) DO UPDATE SET
           attempts = attempts + 1,
           last_error = excluded.last_error,
           last_attempt_at = excluded.last_attempt_at",
        params![id, reason],
      )
      .map_err(|e| eyre!("Failed to record replay failure for {}: {}", id, e))?;

    conn
      .query_row(
        "SELECT attempts FROM replay_attempts WHERE form_id = ?",
        params![id],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to read attempts for {}: {}", id, e))
  }

  /// Failed replays so far.
  pub fn attempts(&self, id: i64) -> Result<u32> {
    let conn = self.db.conn()?;
    let attempts: Option<u32> = conn
      .query_row(
        "SELECT attempts FROM replay_attempts WHERE form_id = ?",
        params![id],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read attempts for {}: {}", id, e))?;

    Ok(attempts.unwrap_or(0))
  }

  /// Move a submission out of the queue into the dead-letter table.
  pub fn dead_letter(&self, id: i64) -> Result<bool> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let moved = tx
      .execute(
        "INSERT INTO dead_letters (id, url, method, headers, body, attempts, last_error)
         SELECT f.id, f.url, f.method, f.headers, f.body,
                COALESCE(a.attempts, 0), a.last_error
         FROM offline_forms f
         LEFT JOIN replay_attempts a ON a.form_id = f.id
         WHERE f.id = ?",
        params![id],
      )
      .map_err(|e| eyre!("Failed to dead-letter submission {}: {}", id, e))?;

    tx.execute("DELETE FROM offline_forms WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete queued submission {}: {}", id, e))?;
    tx.execute("DELETE FROM replay_attempts WHERE form_id = ?", params![id])
      .map_err(|e| eyre!("Failed to clear attempts for {}: {}", id, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    if moved > 0 {
      warn!(id, "Gave up replaying offline submission");
    }
    Ok(moved > 0)
  }

  pub fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, url, method, headers, body, attempts, last_error
         FROM dead_letters ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare dead-letter listing: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          QueuedSubmission::from_row(row)?,
          row.get::<_, u32>(5)?,
          row.get::<_, Option<String>>(6)?,
        ))
      })
      .map_err(|e| eyre!("Failed to list dead letters: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read dead letter: {}", e))?;

    rows
      .into_iter()
      .map(|(raw, attempts, last_error)| {
        Ok(DeadLetter {
          submission: QueuedSubmission::decode(raw)?,
          attempts,
          last_error,
        })
      })
      .collect()
  }

  /// Put a dead letter back on the queue with a fresh attempt count.
  /// It keeps its original id, so it replays in its original position.
  pub fn requeue_dead_letter(&self, id: i64) -> Result<bool> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let moved = tx
      .execute(
        "INSERT INTO offline_forms (id, url, method, headers, body)
         SELECT id, url, method, headers, body FROM dead_letters WHERE id = ?",
        params![id],
      )
      .map_err(|e| eyre!("Failed to requeue dead letter {}: {}", id, e))?;

    tx.execute("DELETE FROM dead_letters WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete dead letter {}: {}", id, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(moved > 0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::Method;
  use url::Url;

  fn queue() -> OfflineQueue {
    OfflineQueue::new(Database::open_in_memory().unwrap())
  }

  fn post(path: &str, body: &str) -> Request {
    let url = Url::parse("http://localhost:3000").unwrap().join(path).unwrap();
    Request::new(Method::POST, url)
      .with_header("Content-Type", "application/json")
      .with_body(body)
  }

  #[test]
  fn test_enqueue_assigns_increasing_ids() {
    let queue = queue();
    let a = queue.enqueue(&post("/api/gardens", "{}")).unwrap();
    let b = queue.enqueue(&post("/api/plants", "{}")).unwrap();

    assert!(b > a);
    let ids: Vec<i64> = queue.all().unwrap().iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![a, b]);
  }

  #[test]
  fn test_submission_fields_survive() {
    let queue = queue();
    let id = queue
      .enqueue(&post("/api/email/subscribe", r#"{"email":"a@b.c"}"#))
      .unwrap();

    let stored = queue.get(id).unwrap().unwrap();
    assert_eq!(stored.url, "http://localhost:3000/api/email/subscribe");
    assert_eq!(stored.method, "POST");
    assert_eq!(
      stored.headers.get("content-type").map(String::as_str),
      Some("application/json")
    );
    assert_eq!(stored.body.as_deref(), Some(br#"{"email":"a@b.c"}"#.as_slice()));

    let replay = stored.to_request().unwrap();
    assert_eq!(replay, post("/api/email/subscribe", r#"{"email":"a@b.c"}"#));
  }

  #[test]
  fn test_delete() {
    let queue = queue();
    let id = queue.enqueue(&post("/api/gardens", "{}")).unwrap();

    assert!(queue.delete(id).unwrap());
    assert!(!queue.delete(id).unwrap());
    assert!(queue.is_empty().unwrap());
  }

  #[test]
  fn test_record_failure_counts_without_touching_record() {
    let queue = queue();
    let id = queue.enqueue(&post("/api/gardens", "{}")).unwrap();
    let before = queue.get(id).unwrap();

    assert_eq!(queue.attempts(id).unwrap(), 0);
    assert_eq!(queue.record_failure(id, "offline").unwrap(), 1);
    assert_eq!(queue.record_failure(id, "503").unwrap(), 2);
    assert_eq!(queue.get(id).unwrap(), before);
  }

  #[test]
  fn test_dead_letter_round_trip() {
    let queue = queue();
    let first = queue.enqueue(&post("/api/gardens", "1")).unwrap();
    let second = queue.enqueue(&post("/api/gardens", "2")).unwrap();
    queue.record_failure(first, "500 Internal Server Error").unwrap();

    assert!(queue.dead_letter(first).unwrap());
    assert_eq!(queue.len().unwrap(), 1);

    let dead = queue.dead_letters().unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].submission.id, first);
    assert_eq!(dead[0].attempts, 1);
    assert_eq!(dead[0].last_error.as_deref(), Some("500 Internal Server Error"));

    assert!(queue.requeue_dead_letter(first).unwrap());
    assert!(queue.dead_letters().unwrap().is_empty());
    let ids: Vec<i64> = queue.all().unwrap().iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![first, second]);
    assert_eq!(queue.attempts(first).unwrap(), 0);
  }

  #[test]
  fn test_dead_letter_missing_id() {
    let queue = queue();
    assert!(!queue.dead_letter(42).unwrap());
    assert!(!queue.requeue_dead_letter(42).unwrap());
  }
}
