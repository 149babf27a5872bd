//! Tracing setup: stderr plus a daily-rotated log file.

use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "plantcache.log";

/// Build the filter: `RUST_LOG` wins, otherwise the configured level.
pub fn filter(config: &LoggingConfig) -> Result<EnvFilter> {
  match EnvFilter::try_from_default_env() {
    Ok(filter) => Ok(filter),
    Err(_) => EnvFilter::try_new(&config.level)
      .map_err(|e| eyre!("Invalid log level '{}': {}", config.level, e)),
  }
}

/// Install the global subscriber.
///
/// Keep the returned guard alive for the life of the process, or buffered
/// file output is lost.
pub fn init(config: &LoggingConfig, log_dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
  let (file_writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::registry()
    .with(filter(config)?)
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(fmt::layer().with_ansi(false).with_writer(file_writer))
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}
