use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base URL of the hosted backend (e.g. "https://project.example.co")
  pub url: String,
  #[serde(default = "default_remote_timeout")]
  pub timeout_secs: u64,
}

impl RemoteConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectivityConfig {
  /// host:port that must accept a TCP connection for us to count as online
  #[serde(default = "default_probe")]
  pub probe: String,
  #[serde(default = "default_probe_interval")]
  pub interval_secs: u64,
  #[serde(default = "default_probe_timeout")]
  pub timeout_ms: u64,
}

impl ConnectivityConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs.max(1))
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe: default_probe(),
      interval_secs: default_probe_interval(),
      timeout_ms: default_probe_timeout(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Queue database location (defaults to $XDG_DATA_HOME/stride/queue.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// Default filter directive; RUST_LOG takes precedence
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Directory for rolling log files (defaults to $XDG_DATA_HOME/stride/logs)
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      directory: None,
    }
  }
}

fn default_remote_timeout() -> u64 {
  15
}

fn default_probe() -> String {
  "1.1.1.1:443".to_string()
}

fn default_probe_interval() -> u64 {
  5
}

fn default_probe_timeout() -> u64 {
  2000
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./stride.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/stride/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/stride/config.yaml\n\
                 with at least a `remote.url` entry."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("stride.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("stride").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Get the backend API key from environment variables.
  ///
  /// Checks STRIDE_API_KEY first, then SUPABASE_ANON_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("STRIDE_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .map_err(|_| {
        eyre!("Backend API key not found. Set STRIDE_API_KEY or SUPABASE_ANON_KEY environment variable.")
      })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("remote:\n  url: https://example.co\n").unwrap();

    assert_eq!(config.remote.url, "https://example.co");
    assert_eq!(config.remote.timeout(), Duration::from_secs(15));
    assert_eq!(config.connectivity.probe, "1.1.1.1:443");
    assert_eq!(config.connectivity.interval(), Duration::from_secs(5));
    assert_eq!(config.connectivity.timeout(), Duration::from_millis(2000));
    assert!(config.storage.path.is_none());
    assert_eq!(config.log.level, "info");
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
remote:
  url: https://example.co
  timeout_secs: 3
connectivity:
  probe: example.co:443
  interval_secs: 0
  timeout_ms: 250
storage:
  path: /tmp/queue.db
log:
  level: debug
  directory: /tmp/logs
"#;
    let config = Config::parse(yaml).unwrap();

    assert_eq!(config.remote.timeout(), Duration::from_secs(3));
    assert_eq!(config.connectivity.probe, "example.co:443");
    // zero interval is clamped so the probe loop never spins
    assert_eq!(config.connectivity.interval(), Duration::from_secs(1));
    assert_eq!(config.storage.path, Some(PathBuf::from("/tmp/queue.db")));
    assert_eq!(config.log.directory, Some(PathBuf::from("/tmp/logs")));
  }

  #[test]
  fn test_missing_remote_is_rejected() {
    assert!(Config::parse("log:\n  level: warn\n").is_err());
  }

  #[test]
  fn test_explicit_missing_path_errors() {
    let err = Config::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
