use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{FetchOutcome, OfflineWorker, SyncReport};
use crate::http::{Network, Request};

/// Events delivered to the worker
#[derive(Debug)]
pub enum WorkerEvent {
  /// Precache the manifest (and activate straight after)
  Install,
  /// Activate an installed worker
  Activate,
  /// Intercept a request; the outcome is sent back on `reply`
  Fetch {
    request: Request,
    reply: oneshot::Sender<Result<FetchOutcome>>,
  },
  /// Connectivity came back; drain the queue registered under this tag
  Sync(String),
  /// Stop the event loop
  Shutdown,
}

impl OfflineWorker {
  /// Handle events one at a time until the channel closes or `Shutdown`.
  pub async fn run(&self, mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
    while let Some(event) = events.recv().await {
      match event {
        WorkerEvent::Install => {
          if let Err(e) = self.start().await {
            error!(error = %e, "Worker failed to start");
          }
        }
        WorkerEvent::Activate => {
          if let Err(e) = self.activate() {
            error!(error = %e, "Worker failed to activate");
          }
        }
        WorkerEvent::Fetch { request, reply } => {
          let outcome = self.handle_fetch(&request).await;
          if reply.send(outcome).is_err() {
            debug!(url = %request.url, "Fetch requester went away");
          }
        }
        WorkerEvent::Sync(tag) => match self.sync(&tag).await {
          Ok(report) => log_sync(&tag, &report),
          Err(e) => error!(tag = %tag, error = %e, "Background sync failed"),
        },
        WorkerEvent::Shutdown => break,
      }
    }
  }
}

fn log_sync(tag: &str, report: &SyncReport) {
  if report.failed > 0 {
    warn!(tag, failed = report.failed, "Some submissions are still queued");
  }
}

const MIN_PROBE_INTERVAL: Duration = Duration::from_millis(1);

/// Watches the origin and signals a sync whenever it becomes reachable.
pub struct ConnectivityMonitor;

impl ConnectivityMonitor {
  /// Spawn the probe loop.
  ///
  /// The first successful probe also signals, so submissions queued by an
  /// earlier run are picked up. The task stops when the receiver is dropped.
  pub fn spawn(
    network: Arc<dyn Network>,
    probe: Url,
    interval: Duration,
    tag: String,
    tx: mpsc::UnboundedSender<WorkerEvent>,
  ) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval.max(MIN_PROBE_INTERVAL));
      let mut online: Option<bool> = None;

      loop {
        ticker.tick().await;
        if tx.is_closed() {
          break;
        }

        let reachable = network.fetch(&Request::get(probe.clone())).await.is_ok();

        if reachable && online != Some(true) {
          info!(probe = %probe, "Origin reachable, requesting sync");
          if tx.send(WorkerEvent::Sync(tag.clone())).is_err() {
            break;
          }
        } else if !reachable && online != Some(false) {
          warn!(probe = %probe, "Origin unreachable, working offline");
        }

        online = Some(reachable);
      }
    })
  }
}
