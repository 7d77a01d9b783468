//! Storage quota monitor.
//!
//! Gates large (video) cache writes on an advisory snapshot of storage usage.
//! Snapshots are not locked and may be stale by the time a write happens; the
//! limit is soft.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use crate::config::QuotaConfig;
use crate::db::Database;

/// Hard cap for a single large payload.
pub const MAX_LARGE_PAYLOAD_BYTES: u64 = 50 * 1024 * 1024;

/// Usage ratio at which large writes are refused.
pub const MAX_USAGE_RATIO: f64 = 0.7;

/// Consumed vs. available storage at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StorageQuotaSnapshot {
  pub used_bytes: u64,
  pub quota_bytes: u64,
  pub ratio: f64,
}

impl StorageQuotaSnapshot {
  pub fn new(used_bytes: u64, quota_bytes: u64) -> Self {
    let ratio = if quota_bytes == 0 {
      1.0
    } else {
      used_bytes as f64 / quota_bytes as f64
    };
    Self {
      used_bytes,
      quota_bytes,
      ratio,
    }
  }
}

/// Source of storage usage figures.
pub trait StorageEstimator: Send + Sync {
  fn estimate(&self) -> Result<StorageQuotaSnapshot>;
}

/// Estimates usage from the engine's own database against a configured quota.
pub struct SqliteEstimator {
  db: Database,
  quota_bytes: u64,
}

impl SqliteEstimator {
  pub fn new(db: Database, quota_bytes: u64) -> Self {
    Self { db, quota_bytes }
  }
}

impl StorageEstimator for SqliteEstimator {
  fn estimate(&self) -> Result<StorageQuotaSnapshot> {
    let conn = self.db.lock()?;
    let cached: i64 = conn
      .query_row(
        "SELECT COALESCE(SUM(LENGTH(body) + LENGTH(headers) + LENGTH(url)), 0) FROM cache_entries",
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to measure cache usage: {}", e))?;
    let queued: i64 = conn
      .query_row(
        "SELECT COALESCE(SUM(COALESCE(LENGTH(body), 0) + LENGTH(headers) + LENGTH(url)), 0) FROM sync_queue",
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to measure queue usage: {}", e))?;

    Ok(StorageQuotaSnapshot::new(
      (cached + queued) as u64,
      self.quota_bytes,
    ))
  }
}

/// Accept/reject decision for large cacheable payloads.
#[derive(Clone)]
pub struct QuotaMonitor {
  estimator: Arc<dyn StorageEstimator>,
  max_ratio: f64,
  max_payload_bytes: u64,
}

impl QuotaMonitor {
  pub fn new(estimator: Arc<dyn StorageEstimator>) -> Self {
    Self {
      estimator,
      max_ratio: MAX_USAGE_RATIO,
      max_payload_bytes: MAX_LARGE_PAYLOAD_BYTES,
    }
  }

  /// Apply configured limits.
  pub fn with_limits(mut self, config: &QuotaConfig) -> Self {
    self.max_ratio = config.max_usage_ratio;
    self.max_payload_bytes = config.max_payload_bytes;
    self
  }

  pub fn snapshot(&self) -> Result<StorageQuotaSnapshot> {
    self.estimator.estimate()
  }

  /// Whether a payload of this size may be written to a large-object cache.
  ///
  /// An unreadable estimate counts as a refusal.
  pub fn should_accept_large_write(&self, payload_bytes: u64) -> bool {
    if payload_bytes >= self.max_payload_bytes {
      return false;
    }
    match self.snapshot() {
      Ok(snapshot) => accepts(&snapshot, payload_bytes, self.max_ratio),
      Err(e) => {
        warn!(error = %e, "Storage estimate unavailable, refusing large write");
        false
      }
    }
  }
}

/// Whether usage after writing `payload_bytes` stays below `max_ratio`.
fn accepts(snapshot: &StorageQuotaSnapshot, payload_bytes: u64, max_ratio: f64) -> bool {
  if snapshot.quota_bytes == 0 {
    return false;
  }
  let after = StorageQuotaSnapshot::new(
    snapshot.used_bytes.saturating_add(payload_bytes),
    snapshot.quota_bytes,
  );
  after.ratio < max_ratio
}
