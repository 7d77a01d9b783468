use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::quota::{MAX_LARGE_PAYLOAD_BYTES, MAX_USAGE_RATIO};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin that relative request paths resolve against
  pub origin: Url,
  /// Engine generation; suffixes every cache name
  #[serde(default = "default_version")]
  pub version: String,
  /// Where the database and logs live (defaults to $XDG_DATA_HOME/lifeline)
  pub data_dir: Option<PathBuf>,
  #[serde(default)]
  pub timeouts: TimeoutConfig,
  #[serde(default)]
  pub quota: QuotaConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub install: InstallConfig,
  /// Freshness window for stale-while-revalidate resources
  #[serde(default = "default_freshness_minutes")]
  pub freshness_minutes: i64,
}

fn default_version() -> String {
  "v1".to_string()
}

fn default_freshness_minutes() -> i64 {
  15
}

/// Network timeouts per resource class, in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
  pub api_ms: u64,
  /// Crisis-marked API endpoints
  pub critical_api_ms: u64,
  pub crisis_ms: u64,
}

impl Default for TimeoutConfig {
  fn default() -> Self {
    Self {
      api_ms: 10_000,
      critical_api_ms: 20_000,
      crisis_ms: 30_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
  pub quota_bytes: u64,
  pub max_usage_ratio: f64,
  pub max_payload_bytes: u64,
}

impl Default for QuotaConfig {
  fn default() -> Self {
    Self {
      quota_bytes: 1024 * 1024 * 1024,
      max_usage_ratio: MAX_USAGE_RATIO,
      max_payload_bytes: MAX_LARGE_PAYLOAD_BYTES,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Pause between replayed records
  pub replay_delay_ms: u64,
  /// Per-record bound on a replay; a replay that outlives it counts as failed
  pub replay_timeout_ms: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      replay_delay_ms: 250,
      replay_timeout_ms: 10_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
  /// Attempts per pre-seeded resource
  pub attempts: u32,
  pub retry_delay_ms: u64,
}

impl Default for InstallConfig {
  fn default() -> Self {
    Self {
      attempts: 3,
      retry_delay_ms: 500,
    }
  }
}

impl Config {
  /// Default configuration for an origin.
  pub fn new(origin: Url) -> Self {
    Self {
      origin,
      version: default_version(),
      data_dir: None,
      timeouts: TimeoutConfig::default(),
      quota: QuotaConfig::default(),
      sync: SyncConfig::default(),
      install: InstallConfig::default(),
      freshness_minutes: default_freshness_minutes(),
    }
  }

  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./lifeline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/lifeline/config.yaml
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => {
        return Err(eyre!(
          "No configuration file found. Create one at ~/.config/lifeline/config.yaml\n\
                 with at least an `origin: https://...` entry."
        ))
      }
    };

    config.with_env_overrides()
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("lifeline.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("lifeline").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.validate()?;
    Ok(config)
  }

  /// Apply `LIFELINE_ORIGIN` if set.
  fn with_env_overrides(mut self) -> Result<Self> {
    if let Ok(origin) = std::env::var("LIFELINE_ORIGIN") {
      self.origin =
        Url::parse(&origin).map_err(|e| eyre!("Invalid LIFELINE_ORIGIN '{}': {}", origin, e))?;
    }
    Ok(self)
  }

  fn validate(&self) -> Result<()> {
    if self.version.is_empty() || self.version.contains(char::is_whitespace) {
      return Err(eyre!("version must be a non-empty label without spaces"));
    }
    if !(0.0..=1.0).contains(&self.quota.max_usage_ratio) {
      return Err(eyre!("quota.max_usage_ratio must be between 0 and 1"));
    }
    if self.sync.replay_timeout_ms == 0 {
      return Err(eyre!("sync.replay_timeout_ms must be at least 1"));
    }
    if self.install.attempts == 0 {
      return Err(eyre!("install.attempts must be at least 1"));
    }
    Ok(())
  }

  /// Directory holding the database and logs.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("lifeline"))
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("lifeline.db"))
  }

  pub fn api_timeout(&self) -> Duration {
    Duration::from_millis(self.timeouts.api_ms)
  }

  pub fn critical_api_timeout(&self) -> Duration {
    Duration::from_millis(self.timeouts.critical_api_ms)
  }

  pub fn crisis_timeout(&self) -> Duration {
    Duration::from_millis(self.timeouts.crisis_ms)
  }

  pub fn install_retry_delay(&self) -> Duration {
    Duration::from_millis(self.install.retry_delay_ms)
  }

  pub fn replay_delay(&self) -> Duration {
    Duration::from_millis(self.sync.replay_delay_ms)
  }

  pub fn replay_timeout(&self) -> Duration {
    Duration::from_millis(self.sync.replay_timeout_ms)
  }

  pub fn freshness(&self) -> chrono::Duration {
    chrono::Duration::minutes(self.freshness_minutes)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::from_yaml("origin: https://app.test\n").unwrap();
    assert_eq!(config.origin.as_str(), "https://app.test/");
    assert_eq!(config.version, "v1");
    assert_eq!(config.api_timeout(), Duration::from_secs(10));
    assert_eq!(config.critical_api_timeout(), Duration::from_secs(20));
    assert_eq!(config.crisis_timeout(), Duration::from_secs(30));
    assert_eq!(config.quota.max_payload_bytes, 50 * 1024 * 1024);
    assert_eq!(config.freshness(), chrono::Duration::minutes(15));
    assert_eq!(config.install.attempts, 3);
    assert_eq!(config.replay_timeout(), Duration::from_secs(10));
  }

  #[test]
  fn test_partial_sections() {
    let config = Config::from_yaml(
      "origin: https://app.test\nversion: v7\ntimeouts:\n  api_ms: 500\nsync:\n  replay_delay_ms: 0\n",
    )
    .unwrap();
    assert_eq!(config.version, "v7");
    assert_eq!(config.api_timeout(), Duration::from_millis(500));
    assert_eq!(config.crisis_timeout(), Duration::from_secs(30));
    assert!(config.replay_delay().is_zero());
  }

  #[test]
  fn test_rejects_invalid_values() {
    assert!(Config::from_yaml("origin: not a url\n").is_err());
    assert!(Config::from_yaml("origin: https://app.test\nversion: 'a b'\n").is_err());
    assert!(Config::from_yaml("origin: https://app.test\nquota:\n  max_usage_ratio: 2\n").is_err());
    assert!(Config::from_yaml("origin: https://app.test\ninstall:\n  attempts: 0\n").is_err());
    assert!(Config::from_yaml("origin: https://app.test\nsync:\n  replay_timeout_ms: 0\n").is_err());
  }

  #[test]
  fn test_missing_explicit_path() {
    assert!(Config::load(Some(Path::new("/nonexistent/lifeline.yaml"))).is_err());
  }

  #[test]
  fn test_explicit_data_dir() {
    let mut config = Config::new(Url::parse("https://app.test").unwrap());
    config.data_dir = Some(PathBuf::from("/tmp/lifeline-test"));
    assert_eq!(
      config.database_path().unwrap(),
      PathBuf::from("/tmp/lifeline-test/lifeline.db")
    );
  }
}
