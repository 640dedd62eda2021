use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LogConfig;

/// Install the global subscriber: stderr plus a daily rolling file.
///
/// The returned guard flushes the file writer on drop and must be kept
/// alive for the rest of the process.
pub fn init(config: &LogConfig) -> Result<WorkerGuard> {
  let directory = match &config.directory {
    Some(dir) => dir.clone(),
    None => default_directory()?,
  };
  std::fs::create_dir_all(&directory)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;

  let appender = tracing_appender::rolling::daily(&directory, "stride.log");
  let (file_writer, guard) = tracing_appender::non_blocking(appender);

  let env_filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

  tracing_subscriber::registry()
    .with(env_filter)
    .with(
      fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr),
    )
    .with(fmt::layer().with_ansi(false).with_writer(file_writer))
    .try_init()
    .map_err(|e| eyre!("Failed to install logger: {}", e))?;

  Ok(guard)
}

fn default_directory() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("stride").join("logs"))
}
