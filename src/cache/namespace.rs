//! Cache namespaces, engine versions and expiration policies.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Report};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix shared by every physical cache name this engine creates.
pub const CACHE_PREFIX: &str = "lifeline";

/// A logical partition of the cache store set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheNamespace {
  Crisis,
  Api,
  Community,
  Images,
  Video,
  CriticalFallback,
}

impl CacheNamespace {
  pub const ALL: [CacheNamespace; 6] = [
    Self::Crisis,
    Self::Api,
    Self::Community,
    Self::Images,
    Self::Video,
    Self::CriticalFallback,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Crisis => "crisis",
      Self::Api => "api",
      Self::Community => "community",
      Self::Images => "images",
      Self::Video => "video",
      Self::CriticalFallback => "critical-fallback",
    }
  }

  /// Automatic eviction policy. Crisis and critical-fallback are never
  /// evicted automatically.
  pub fn expiration(self) -> ExpirationPolicy {
    match self {
      Self::Crisis | Self::CriticalFallback => ExpirationPolicy::NONE,
      Self::Api => ExpirationPolicy::new(Duration::hours(24), 100),
      Self::Community => ExpirationPolicy::new(Duration::days(7), 200),
      Self::Images => ExpirationPolicy::new(Duration::days(7), 100),
      Self::Video => ExpirationPolicy::new(Duration::days(30), 10),
    }
  }
}

impl fmt::Display for CacheNamespace {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for CacheNamespace {
  type Err = Report;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::ALL
      .into_iter()
      .find(|ns| ns.as_str() == s)
      .ok_or_else(|| eyre!("Unknown cache namespace: {}", s))
  }
}

/// The active code generation. Every physical cache name carries it as a
/// suffix so a new version never shares storage with an older one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct EngineVersion(String);

impl EngineVersion {
  pub fn new(label: impl Into<String>) -> Self {
    Self(label.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Physical cache name for a namespace under this version.
  pub fn cache_name(&self, namespace: CacheNamespace) -> String {
    format!("{}-{}-{}", CACHE_PREFIX, namespace.as_str(), self.0)
  }

  /// Every cache name this version owns.
  pub fn known_cache_names(&self) -> Vec<String> {
    CacheNamespace::ALL
      .into_iter()
      .map(|ns| self.cache_name(ns))
      .collect()
  }
}

impl fmt::Display for EngineVersion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Max-age and max-entry limits for a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirationPolicy {
  pub max_age: Option<Duration>,
  pub max_entries: Option<usize>,
}

impl ExpirationPolicy {
  pub const NONE: Self = Self {
    max_age: None,
    max_entries: None,
  };

  pub fn new(max_age: Duration, max_entries: usize) -> Self {
    Self {
      max_age: Some(max_age),
      max_entries: Some(max_entries),
    }
  }

  pub fn is_expired(&self, cached_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    self
      .max_age
      .map(|max_age| now - cached_at > max_age)
      .unwrap_or(false)
  }
}
