use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::DEFAULT_STATIC_EXTENSIONS;
use crate::lifecycle::NotificationDefaults;
use crate::sync::{SyncSettings, DEFAULT_RETRY_LIMIT};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub remote: RemoteConfig,
  pub sync: SyncConfig,
  pub cache: CacheConfig,
  pub storage: StorageConfig,
  pub notifications: NotificationDefaults,
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
  /// Base URL mutations are posted to
  pub api_base: String,
  /// Application origin; requests to other hosts are treated as API calls
  pub origin: String,
  /// Deadline for every network call
  pub timeout_secs: u64,
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      api_base: "http://localhost:8080/".to_string(),
      origin: "http://localhost:8080/".to_string(),
      timeout_secs: 10,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub interval_secs: u64,
  pub retry_limit: u32,
  pub sync_on_enqueue: bool,
  /// Connectivity assumed at startup
  pub start_online: bool,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      interval_secs: 30,
      retry_limit: DEFAULT_RETRY_LIMIT,
      sync_on_enqueue: true,
      start_online: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Name of the cache generation this build serves
  pub generation: String,
  /// Paths (relative to the origin) fetched on install
  pub precache: Vec<String>,
  pub static_extensions: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      generation: "modernreader-v1.0.0".to_string(),
      precache: ["/", "/index.html", "/manifest.json"]
        .iter()
        .map(|s| s.to_string())
        .collect(),
      static_extensions: DEFAULT_STATIC_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// SQLite file (defaults to $XDG_DATA_HOME/readersync/state.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Write daily rolling log files here instead of stderr
  pub directory: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./readersync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/readersync/config.yaml
  ///
  /// Without a file the built-in defaults are used.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("readersync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("readersync").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents)?;
    if config.sync.retry_limit == 0 {
      return Err(eyre!("sync.retry_limit must be at least 1"));
    }
    config.api_base()?;
    config.origin()?;
    Ok(config)
  }

  pub fn api_base(&self) -> Result<Url> {
    Url::parse(&self.remote.api_base)
      .map_err(|e| eyre!("Invalid remote.api_base {:?}: {}", self.remote.api_base, e))
  }

  pub fn origin(&self) -> Result<Url> {
    Url::parse(&self.remote.origin)
      .map_err(|e| eyre!("Invalid remote.origin {:?}: {}", self.remote.origin, e))
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.remote.timeout_secs)
  }

  pub fn sync_settings(&self) -> SyncSettings {
    SyncSettings {
      retry_limit: self.sync.retry_limit,
      interval: Duration::from_secs(self.sync.interval_secs),
      dispatch_timeout: self.timeout(),
      sync_on_enqueue: self.sync.sync_on_enqueue,
    }
  }

  /// Get the API token from the environment, if one is set.
  ///
  /// Checks READERSYNC_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("READERSYNC_API_TOKEN")
      .ok()
      .filter(|token| !token.is_empty())
  }
}
