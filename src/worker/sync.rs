//! Background sync: replay queued submissions once the network is back.

use color_eyre::{eyre::eyre, Result};
use tracing::{debug, error, info, warn};

use super::OfflineWorker;
use crate::queue::QueuedSubmission;

/// Outcome of one pass over the offline queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
  /// The tag did not name the offline queue; nothing was done
  pub ignored: bool,
  pub attempted: usize,
  /// Accepted by the server and removed from the queue
  pub replayed: usize,
  /// Still queued for the next pass (or dead-lettered)
  pub failed: usize,
  /// Moved out of the queue after reaching the attempt limit
  pub dead_lettered: usize,
}

impl SyncReport {
  fn ignored() -> Self {
    Self {
      ignored: true,
      ..Self::default()
    }
  }
}

impl OfflineWorker {
  /// Handle a sync signal. Only the configured tag drains the queue.
  pub async fn sync(&self, tag: &str) -> Result<SyncReport> {
    if tag != self.config.sync.tag {
      debug!(tag, "Ignoring sync for unknown tag");
      return Ok(SyncReport::ignored());
    }

    self.replay_queue().await
  }

  /// Replay every queued submission in insertion order.
  ///
  /// Accepted submissions are deleted. Anything else stays queued, untouched,
  /// for the next pass unless the configured attempt limit moves it to the
  /// dead letters. Delivery is at-least-once.
  pub async fn replay_queue(&self) -> Result<SyncReport> {
    let submissions = self
      .queue
      .all()
      .map_err(|e| e.wrap_err("Error syncing forms"))?;

    let mut report = SyncReport::default();

    for submission in submissions {
      report.attempted += 1;

      match self.replay(&submission).await {
        Ok(()) => {
          report.replayed += 1;
          if let Err(e) = self.queue.delete(submission.id) {
            // It will be sent again next pass
            error!(id = submission.id, error = %e, "Replayed submission could not be removed");
          }
        }
        Err(e) => {
          report.failed += 1;
          warn!(id = submission.id, url = %submission.url, error = %e, "Sync failed for form data");
          if self.note_failure(&submission, &e.to_string()) {
            report.dead_lettered += 1;
          }
        }
      }
    }

    if report.attempted > 0 {
      info!(
        attempted = report.attempted,
        replayed = report.replayed,
        failed = report.failed,
        dead_lettered = report.dead_lettered,
        "Offline queue synced"
      );
    }

    Ok(report)
  }

  async fn replay(&self, submission: &QueuedSubmission) -> Result<()> {
    let request = submission.to_request()?;
    let response = self.network.fetch(&request).await?;

    if response.is_success() {
      debug!(id = submission.id, status = response.status.as_u16(), "Replayed submission");
      Ok(())
    } else {
      Err(eyre!("server answered {}", response.status))
    }
  }

  /// Count a failed replay. Returns whether the submission was dead-lettered.
  fn note_failure(&self, submission: &QueuedSubmission, reason: &str) -> bool {
    let attempts = match self.queue.record_failure(submission.id, reason) {
      Ok(attempts) => attempts,
      Err(e) => {
        error!(id = submission.id, error = %e, "Could not record replay failure");
        return false;
      }
    };

    let Some(max_attempts) = self.config.sync.max_attempts else {
      return false;
    };
    if attempts < max_attempts {
      return false;
    }

    match self.queue.dead_letter(submission.id) {
      Ok(moved) => moved,
      Err(e) => {
        error!(id = submission.id, error = %e, "Could not dead-letter submission");
        false
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Config;
  use crate::db::Database;
  use crate::http::{Request, Response};
  use crate::testing::{url, ScriptedNetwork};
  use reqwest::{Method, StatusCode};
  use std::sync::Arc;

  fn worker(max_attempts: Option<u32>) -> (OfflineWorker, Arc<ScriptedNetwork>) {
    let network = Arc::new(ScriptedNetwork::new());
    let mut config = Config::default();
    config.sync.max_attempts = max_attempts;
    let worker =
      OfflineWorker::new(config, Database::open_in_memory().unwrap(), network.clone()).unwrap();
    (worker, network)
  }

  fn submission(path: &str, body: &str) -> Request {
    Request::new(Method::POST, url(path))
      .with_header("content-type", "application/json")
      .with_header("authorization", "Bearer t0ken")
      .with_body(body)
  }

  #[tokio::test]
  async fn test_unknown_tag_is_ignored() {
    let (worker, network) = worker(None);
    worker.queue().enqueue(&submission("/api/gardens", "{}")).unwrap();

    let report = worker.sync("sync-photos").await.unwrap();

    assert!(report.ignored);
    assert_eq!(network.call_count(), 0);
    assert_eq!(worker.queue().len().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_drain_deletes_only_successes() {
    let (worker, network) = worker(None);
    network.respond(&url("/api/gardens"), Response::new(StatusCode::CREATED, "{}"));
    network.respond(&url("/api/zones"), Response::new(StatusCode::OK, "{}"));
    network.respond(
      &url("/api/plants"),
      Response::new(StatusCode::INTERNAL_SERVER_ERROR, "boom"),
    );
    network.unreachable(&url("/api/email/subscribe"));

    let queue = worker.queue();
    queue.enqueue(&submission("/api/gardens", r#"{"name":"Backyard"}"#)).unwrap();
    let plants = queue.enqueue(&submission("/api/plants", r#"{"name":"Kale"}"#)).unwrap();
    queue.enqueue(&submission("/api/zones", r#"{"zone":"7b"}"#)).unwrap();
    let email = queue
      .enqueue(&submission("/api/email/subscribe", r#"{"email":"a@b.c"}"#))
      .unwrap();
    let before: Vec<_> = queue
      .all()
      .unwrap()
      .into_iter()
      .filter(|s| s.id == plants || s.id == email)
      .collect();

    let report = worker.sync("sync-forms").await.unwrap();

    assert_eq!(
      report,
      SyncReport {
        ignored: false,
        attempted: 4,
        replayed: 2,
        failed: 2,
        dead_lettered: 0,
      }
    );
    assert_eq!(queue.all().unwrap(), before);
    assert_eq!(queue.attempts(plants).unwrap(), 1);
    assert_eq!(queue.attempts(email).unwrap(), 1);
  }

  #[tokio::test]
  async fn test_replay_preserves_request() {
    let (worker, network) = worker(None);
    network.respond_ok(&url("/api/gardens"), "{}");
    let original = submission("/api/gardens", r#"{"name":"Backyard"}"#);
    worker.queue().enqueue(&original).unwrap();

    worker.sync("sync-forms").await.unwrap();

    assert_eq!(network.calls(), vec![original]);
    assert!(worker.queue().is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_replays_in_insertion_order() {
    let (worker, network) = worker(None);
    for path in ["/api/a", "/api/b", "/api/c"] {
      network.respond_ok(&url(path), "{}");
      worker.queue().enqueue(&submission(path, "{}")).unwrap();
    }

    worker.sync("sync-forms").await.unwrap();

    let order: Vec<String> = network.calls().iter().map(|r| r.url.path().to_string()).collect();
    assert_eq!(order, vec!["/api/a", "/api/b", "/api/c"]);
  }

  #[tokio::test]
  async fn test_unbounded_retry_by_default() {
    let (worker, network) = worker(None);
    network.set_offline(true);
    let id = worker.queue().enqueue(&submission("/api/gardens", "{}")).unwrap();

    for _ in 0..5 {
      worker.sync("sync-forms").await.unwrap();
    }

    assert_eq!(worker.queue().attempts(id).unwrap(), 5);
    assert!(worker.queue().dead_letters().unwrap().is_empty());

    network.set_offline(false);
    network.respond_ok(&url("/api/gardens"), "{}");
    let report = worker.sync("sync-forms").await.unwrap();
    assert_eq!(report.replayed, 1);
    assert!(worker.queue().is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_attempt_limit_dead_letters() {
    let (worker, network) = worker(Some(2));
    network.set_offline(true);
    let id = worker.queue().enqueue(&submission("/api/gardens", "{}")).unwrap();

    let first = worker.sync("sync-forms").await.unwrap();
    assert_eq!(first.dead_lettered, 0);
    assert_eq!(worker.queue().len().unwrap(), 1);

    let second = worker.sync("sync-forms").await.unwrap();
    assert_eq!(second.dead_lettered, 1);
    assert!(worker.queue().is_empty().unwrap());

    let dead = worker.queue().dead_letters().unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].submission.id, id);
    assert_eq!(dead[0].attempts, 2);
  }

  #[tokio::test]
  async fn test_empty_queue() {
    let (worker, network) = worker(None);
    let report = worker.sync("sync-forms").await.unwrap();
    assert_eq!(report, SyncReport::default());
    assert_eq!(network.call_count(), 0);
  }
}
