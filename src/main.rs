use chrono::Duration;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use plantcache::cache::{ExpiringCache, Lookup, SqliteKvStore};
use plantcache::config::Config;
use plantcache::db::Database;
use plantcache::http::{HttpNetwork, Network, Request};
use plantcache::logging;
use plantcache::worker::{ConnectivityMonitor, FetchOutcome, OfflineWorker, WorkerEvent};

#[derive(Parser, Debug)]
#[command(name = "plantcache")]
#[command(about = "Offline cache and form sync for PlantPerfectly")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/plantcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin to serve, e.g. http://localhost:3000
  #[arg(short, long)]
  origin: Option<String>,

  /// Database file (default: $XDG_DATA_HOME/plantcache/cache.db)
  #[arg(long)]
  db: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the app shell and activate, dropping caches from older versions
  Install,
  /// Send a request through the worker
  Fetch {
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Accept header (use text/html to get the offline page when offline)
    #[arg(long)]
    accept: Option<String>,
    /// JSON request body
    #[arg(short, long)]
    data: Option<String>,
  },
  /// Replay queued form submissions now
  Sync {
    #[arg(long)]
    tag: Option<String>,
  },
  /// Inspect the offline queue
  #[command(subcommand)]
  Queue(QueueCommand),
  /// List named response caches
  Caches,
  /// Expiring key-value cache
  #[command(subcommand)]
  Kv(KvCommand),
  /// Run the worker and sync whenever the origin comes back
  Watch,
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  /// Pending submissions
  List,
  /// Submissions that gave up after too many attempts
  Dead,
  /// Put a dead submission back in the queue
  Requeue { id: i64 },
}

#[derive(Subcommand, Debug)]
enum KvCommand {
  Get {
    key: String,
  },
  /// Store a JSON value (plain text is stored as a string)
  Put {
    key: String,
    value: String,
    /// Lifetime in milliseconds (default from config)
    #[arg(long, value_parser = clap::value_parser!(i64).range(1..))]
    ttl_ms: Option<i64>,
  },
  Invalidate {
    key: String,
  },
  /// Remove every cache entry
  Clear,
  /// Remove expired and unreadable entries
  Evict,
  Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let mut config = Config::load(args.config.as_deref())?;
  if let Some(origin) = args.origin {
    config.origin = origin;
  }
  if let Some(db) = args.db {
    config.store.path = Some(db);
  }
  config.validate()?;

  let _guard = logging::init(&config.logging, &config.log_dir()?)?;

  let db = Database::open(&config.database_path()?)?;

  match args.command {
    Command::Kv(command) => run_kv(command, &config, db),
    Command::Queue(command) => {
      let worker = build_worker(config, db)?;
      run_queue(command, &worker)
    }
    Command::Caches => {
      let worker = build_worker(config, db)?;
      for name in worker.caches().keys()? {
        let entries = worker.caches().open(&name)?.len()?;
        println!("{}\t{}", name, entries);
      }
      Ok(())
    }
    Command::Install => {
      let worker = build_worker(config, db)?;
      let report = worker.start().await?;
      println!("Installed, worker state {:?}", worker.state());
      for name in report.deleted_caches {
        println!("Deleted stale cache {}", name);
      }
      Ok(())
    }
    Command::Fetch {
      url,
      method,
      accept,
      data,
    } => {
      let worker = build_worker(config, db)?;
      let mut request = Request::parse(&method, &url)?;
      if let Some(accept) = accept {
        request = request.with_header("accept", &accept);
      }
      if let Some(data) = data {
        request = request
          .with_header("content-type", "application/json")
          .with_body(data);
      }
      fetch(&worker, &request).await
    }
    Command::Sync { tag } => {
      let worker = build_worker(config, db)?;
      let tag = tag.unwrap_or_else(|| worker.config().sync.tag.clone());
      let report = worker.sync(&tag).await?;
      if report.ignored {
        println!("No queue is registered under '{}'", tag);
      } else {
        println!(
          "attempted {}, replayed {}, failed {}, dead-lettered {}",
          report.attempted, report.replayed, report.failed, report.dead_lettered
        );
      }
      Ok(())
    }
    Command::Watch => watch(build_worker(config, db)?).await,
  }
}

fn build_worker(config: Config, db: Database) -> Result<OfflineWorker> {
  let network = Arc::new(HttpNetwork::new(config.network_timeout())?);
  OfflineWorker::new(config, db, network)
}

async fn fetch(worker: &OfflineWorker, request: &Request) -> Result<()> {
  if !worker.resume()? {
    warn!("Worker is not installed; run `plantcache install` first");
  }

  let response = match worker.handle_fetch(request).await? {
    FetchOutcome::Passthrough => worker.network().fetch(request).await?,
    FetchOutcome::Response { response, source } => {
      eprintln!("{} ({:?})", response.status, source);
      response
    }
    FetchOutcome::Queued { id } => {
      println!("Offline: queued as #{}", id);
      return Ok(());
    }
  };

  println!("{}", response.text());
  Ok(())
}

fn run_queue(command: QueueCommand, worker: &OfflineWorker) -> Result<()> {
  let queue = worker.queue();
  match command {
    QueueCommand::List => {
      for submission in queue.all()? {
        let attempts = queue.attempts(submission.id)?;
        println!(
          "#{}\t{} {}\t{} attempts",
          submission.id, submission.method, submission.url, attempts
        );
      }
    }
    QueueCommand::Dead => {
      for dead in queue.dead_letters()? {
        println!(
          "#{}\t{} {}\t{} attempts\t{}",
          dead.submission.id,
          dead.submission.method,
          dead.submission.url,
          dead.attempts,
          dead.last_error.as_deref().unwrap_or("-")
        );
      }
    }
    QueueCommand::Requeue { id } => {
      if !queue.requeue_dead_letter(id)? {
        return Err(eyre!("No dead submission #{}", id));
      }
      println!("Requeued #{}", id);
    }
  }
  Ok(())
}

fn run_kv(command: KvCommand, config: &Config, db: Database) -> Result<()> {
  let cache = ExpiringCache::new(SqliteKvStore::new(db), config.cache_settings());

  match command {
    KvCommand::Get { key } => match cache.get::<serde_json::Value>(&key) {
      Lookup::Hit(value) => println!("{}", serde_json::to_string_pretty(&value)?),
      Lookup::Miss(reason) => println!("miss ({:?})", reason),
    },
    KvCommand::Put { key, value, ttl_ms } => {
      let value = serde_json::from_str::<serde_json::Value>(&value)
        .unwrap_or(serde_json::Value::String(value));
      cache.put(&key, &value, ttl_ms.map(Duration::milliseconds))?;
    }
    KvCommand::Invalidate { key } => cache.invalidate(&key)?,
    KvCommand::Clear => println!("Removed {} entries", cache.invalidate_all()?),
    KvCommand::Evict => {
      let report = cache.evict_expired()?;
      println!("Removed {} expired, {} corrupt", report.expired, report.corrupt);
    }
    KvCommand::Stats => println!("{}", serde_json::to_string_pretty(&cache.stats())?),
  }
  Ok(())
}

async fn watch(worker: OfflineWorker) -> Result<()> {
  let worker = Arc::new(worker);
  let (tx, rx) = mpsc::unbounded_channel();

  if !worker.resume()? {
    tx.send(WorkerEvent::Install)
      .map_err(|_| eyre!("Worker stopped before install"))?;
  }

  let runner = {
    let worker = worker.clone();
    tokio::spawn(async move { worker.run(rx).await })
  };

  let config = worker.config();
  let monitor = ConnectivityMonitor::spawn(
    worker.network().clone(),
    config.resolve(&config.sync.probe_path)?,
    config.probe_interval(),
    config.sync.tag.clone(),
    tx.clone(),
  );

  info!(origin = %config.origin, "Watching for connectivity");
  tokio::signal::ctrl_c().await?;

  monitor.abort();
  let _ = tx.send(WorkerEvent::Shutdown);
  runner.await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_kv_put_rejects_non_positive_ttl() {
    for ttl in ["0", "-1", "-9223372036854775808"] {
      let parsed = Args::try_parse_from(["plantcache", "kv", "put", "k", "1", "--ttl-ms", ttl]);
      assert!(parsed.is_err(), "accepted ttl {}", ttl);
    }

    let args =
      Args::try_parse_from(["plantcache", "kv", "put", "k", "1", "--ttl-ms", "9223372036854775807"])
        .unwrap();
    assert!(matches!(
      args.command,
      Command::Kv(KvCommand::Put { ttl_ms: Some(i64::MAX), .. })
    ));
  }
}
