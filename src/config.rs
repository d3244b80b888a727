use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{QueryKey, DEFAULT_APP_KEY};
use crate::confirm::PollConfig;
use crate::mutation::{ErrorClassifier, DEFAULT_CANCEL_PATTERNS, DEFAULT_CONFLICT_PATTERNS};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub confirmation: ConfirmationConfig,
  pub cache: CacheConfig,
  pub errors: ErrorsConfig,
  pub logging: LoggingConfig,
}

/// Bounds for waiting on a submitted action.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConfirmationConfig {
  pub poll_interval_ms: u64,
  pub timeout_ms: u64,
  pub max_attempts: u32,
}

impl Default for ConfirmationConfig {
  fn default() -> Self {
    let defaults = PollConfig::default();
    Self {
      poll_interval_ms: defaults.poll_interval.as_millis() as u64,
      timeout_ms: defaults.timeout.as_millis() as u64,
      max_attempts: defaults.max_attempts,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Seconds before a cached read is refetched
  pub stale_time_secs: u64,
  /// Write persistable entries to the local database
  pub persist: bool,
  /// Database file (defaults to the platform data directory)
  pub db_path: Option<PathBuf>,
  /// Namespace for persisted rows
  pub app_key: String,
  /// Key prefixes allowed to be persisted, as JSON arrays (e.g. `["todos"]`)
  pub persist_keys: Vec<serde_json::Value>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time_secs: 300,
      persist: true,
      db_path: None,
      app_key: DEFAULT_APP_KEY.to_string(),
      persist_keys: vec![serde_json::json!(["todos"])],
    }
  }
}

/// Phrases that reclassify free-text action failures (case-insensitive).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ErrorsConfig {
  pub conflict_patterns: Vec<String>,
  pub cancel_patterns: Vec<String>,
}

impl Default for ErrorsConfig {
  fn default() -> Self {
    Self {
      conflict_patterns: DEFAULT_CONFLICT_PATTERNS.iter().map(|s| s.to_string()).collect(),
      cancel_patterns: DEFAULT_CANCEL_PATTERNS.iter().map(|s| s.to_string()).collect(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// `EnvFilter` directive; `RUST_LOG` takes precedence
  pub filter: String,
  /// Also write daily-rotated logs here
  pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      filter: "qsync=info".to_string(),
      dir: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./qsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/qsync/config.yaml
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
    let local = PathBuf::from("qsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("qsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.confirmation.timeout_ms == 0 {
      return Err(eyre!("confirmation.timeout_ms must be greater than zero"));
    }
    config.stale_time()?;
    Ok(config)
  }

  pub fn poll_config(&self) -> PollConfig {
    PollConfig {
      poll_interval: Duration::from_millis(self.confirmation.poll_interval_ms),
      timeout: Duration::from_millis(self.confirmation.timeout_ms),
      max_attempts: self.confirmation.max_attempts,
    }
  }

  pub fn classifier(&self) -> ErrorClassifier {
    ErrorClassifier::new(&self.errors.conflict_patterns, &self.errors.cancel_patterns)
  }

  pub fn stale_time(&self) -> Result<chrono::Duration> {
    i64::try_from(self.cache.stale_time_secs)
      .ok()
      .and_then(chrono::Duration::try_seconds)
      .ok_or_else(|| eyre!("cache.stale_time_secs is out of range: {}", self.cache.stale_time_secs))
  }

  /// Persistable prefixes parsed into keys.
  pub fn persist_keys(&self) -> Result<Vec<QueryKey>> {
    self
      .cache
      .persist_keys
      .iter()
      .map(|v| {
        QueryKey::from_json(v.clone()).map_err(|e| eyre!("Invalid cache.persist_keys entry {}: {}", v, e))
      })
      .collect()
  }

  /// Database location.
  ///
  /// Checks QSYNC_DB_PATH, then the configured path, then
  /// $XDG_DATA_HOME/qsync/cache.db.
  pub fn db_path(&self) -> Result<PathBuf> {
    if let Ok(p) = std::env::var("QSYNC_DB_PATH") {
      return Ok(PathBuf::from(p));
    }
    if let Some(p) = &self.cache.db_path {
      return Ok(p.clone());
    }
    dirs::data_dir()
      .map(|d| d.join("qsync").join("cache.db"))
      .ok_or_else(|| eyre!("Could not determine data directory. Set QSYNC_DB_PATH."))
  }
}
