use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use offline_sync::cache::{DataType, TtlPolicy};
use offline_sync::engine::EngineOptions;
use offline_sync::events::DEFAULT_EVENT_CAPACITY;
use offline_sync::queue::DEFAULT_MAX_RETRIES;
use offline_sync::sync::{Backoff, SyncPolicy};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
  #[serde(default)]
  pub store: StoreConfig,
  #[serde(default)]
  pub transport: TransportConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub events: EventsConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
  /// Database file (default: $XDG_DATA_HOME/offline-sync/engine.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
  /// Backend base URL; required for delivering actions
  pub url: Option<String>,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for TransportConfig {
  fn default() -> Self {
    Self {
      url: None,
      timeout_secs: default_timeout_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
  #[serde(default)]
  pub backoff: BackoffConfig,
  /// Keep permanently failed actions for manual review
  #[serde(default = "default_true")]
  pub keep_failed: bool,
  /// How often `run` probes the backend for reachability
  #[serde(default = "default_probe_interval_secs")]
  pub probe_interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_retries: default_max_retries(),
      backoff: BackoffConfig::default(),
      keep_failed: true,
      probe_interval_secs: default_probe_interval_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfig {
  #[serde(default = "default_backoff_initial_ms")]
  pub initial_ms: u64,
  #[serde(default = "default_backoff_max_ms")]
  pub max_ms: u64,
}

impl Default for BackoffConfig {
  fn default() -> Self {
    Self {
      initial_ms: default_backoff_initial_ms(),
      max_ms: default_backoff_max_ms(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_sweep_interval_secs")]
  pub sweep_interval_secs: u64,
  /// Per data type TTL in seconds, replacing the built-in default
  #[serde(default)]
  pub ttl_overrides: BTreeMap<DataType, u64>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      sweep_interval_secs: default_sweep_interval_secs(),
      ttl_overrides: BTreeMap::new(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
  #[serde(default = "default_event_capacity")]
  pub capacity: usize,
}

impl Default for EventsConfig {
  fn default() -> Self {
    Self {
      capacity: default_event_capacity(),
    }
  }
}

fn default_timeout_secs() -> u64 {
  15
}

fn default_max_retries() -> u32 {
  DEFAULT_MAX_RETRIES
}

fn default_true() -> bool {
  true
}

fn default_probe_interval_secs() -> u64 {
  30
}

fn default_backoff_initial_ms() -> u64 {
  1_000
}

fn default_backoff_max_ms() -> u64 {
  60_000
}

fn default_sweep_interval_secs() -> u64 {
  300
}

fn default_event_capacity() -> usize {
  DEFAULT_EVENT_CAPACITY
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./offline-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-sync/config.yaml
  ///
  /// Falls back to defaults when no file is found.
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
    // Check current directory
    let local = PathBuf::from("offline-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-sync").join("config.yaml");
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
    // An empty file deserializes to null; treat it as all defaults
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  /// Get the backend bearer token from the environment, if set.
  pub fn get_api_token() -> Option<String> {
    std::env::var("OFFLINE_SYNC_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }

  pub fn transport_url(&self) -> Result<&str> {
    self.transport.url.as_deref().ok_or_else(|| {
      eyre!("No backend configured. Set transport.url in offline-sync.yaml to deliver actions.")
    })
  }

  pub fn delivery_timeout(&self) -> Duration {
    Duration::from_secs(self.transport.timeout_secs)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.sync.probe_interval_secs.max(1))
  }

  pub fn sweep_interval(&self) -> Duration {
    Duration::from_secs(self.cache.sweep_interval_secs.max(1))
  }

  /// Engine tunables derived from this configuration.
  pub fn engine_options(&self) -> Result<EngineOptions> {
    let mut ttl_policy = TtlPolicy::new();
    for (data_type, secs) in &self.cache.ttl_overrides {
      let ttl = i64::try_from(*secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .ok_or_else(|| eyre!("cache.ttl_overrides.{}: {} seconds is out of range", data_type, secs))?;
      ttl_policy = ttl_policy.with_override(*data_type, ttl);
    }

    Ok(EngineOptions {
      event_capacity: self.events.capacity,
      max_retries: self.sync.max_retries,
      ttl_policy,
      sync_policy: SyncPolicy {
        delivery_timeout: self.delivery_timeout(),
        backoff: Backoff::new(
          Duration::from_millis(self.sync.backoff.initial_ms),
          Duration::from_millis(self.sync.backoff.max_ms),
        ),
        keep_failed: self.sync.keep_failed,
      },
    })
  }
}
