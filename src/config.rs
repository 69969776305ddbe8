use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base URL of the hosted backend (e.g., "https://abc.example.co")
  pub url: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
  /// Attempts after which a queued operation stops being retried
  pub max_attempts: u32,
  /// Wait after coming back online before syncing
  pub settle_delay_ms: u64,
  /// How often the connectivity probe runs
  pub probe_interval_secs: u64,
  /// First retry delay; 0 retries on the next drain without waiting
  pub backoff_base_ms: u64,
  pub backoff_max_ms: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      settle_delay_ms: 1500,
      probe_interval_secs: 15,
      backoff_base_ms: 0,
      backoff_max_ms: 30_000,
    }
  }
}

impl SyncConfig {
  pub fn settle_delay(&self) -> Duration {
    Duration::from_millis(self.settle_delay_ms)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
  /// SQLite file (defaults to the platform data directory)
  pub path: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./splitsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/splitsync/config.yaml
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
        "No configuration file found. Create one at ~/.config/splitsync/config.yaml\n\
                 with at least `remote: {{ url: ... }}`."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("splitsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("splitsync").join("config.yaml");
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

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    if config.sync.max_attempts == 0 {
      return Err(eyre!("sync.max_attempts must be at least 1"));
    }
    Ok(config)
  }

  /// Get the backend API key from the environment.
  ///
  /// Checks SPLITSYNC_API_KEY.
  pub fn get_api_key() -> Result<String> {
    std::env::var("SPLITSYNC_API_KEY")
      .map_err(|_| eyre!("API key not found. Set the SPLITSYNC_API_KEY environment variable."))
  }

  /// Get the session access token, if signed in.
  ///
  /// Checks SPLITSYNC_ACCESS_TOKEN.
  pub fn get_access_token() -> Option<String> {
    std::env::var("SPLITSYNC_ACCESS_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}
