//! Durable queue of mutating requests that could not be delivered.
//!
//! Records are written in a single statement before `enqueue` returns, drained
//! in `id` order, and removed only after a replay the server accepted. Delivery
//! is at-least-once: a replay whose response is lost will be sent again on the
//! next drain, so endpoints receiving replays must tolerate duplicates.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::db::{format_timestamp, parse_timestamp, Database};
use crate::http::{parse_method, Request};
use crate::network::Network;

/// A persisted failed request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncQueueRecord {
  pub id: i64,
  pub url: String,
  pub method: String,
  pub headers: BTreeMap<String, String>,
  pub body: Option<String>,
  pub enqueued_at: DateTime<Utc>,
  pub retry_count: u32,
}

impl SyncQueueRecord {
  /// Rebuild the exact request for replay.
  pub fn to_request(&self) -> Result<Request> {
    let url = Url::parse(&self.url).map_err(|e| eyre!("Invalid queued URL {}: {}", self.url, e))?;
    let mut request = Request::new(parse_method(&self.method)?, url);
    request.headers = self.headers.clone();
    request.body = self.body.clone();
    Ok(request)
  }
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
  pub replayed: usize,
  pub failed: usize,
  pub remaining: usize,
}

/// A `sync_queue` row as stored, before its columns are decoded.
struct QueueRow {
  id: i64,
  url: String,
  method: String,
  headers: String,
  body: Option<String>,
  timestamp: String,
  retry_count: u32,
}

impl QueueRow {
  fn decode(self) -> Result<SyncQueueRecord> {
    let headers = serde_json::from_str(&self.headers)
      .map_err(|e| eyre!("Failed to deserialize headers of record {}: {}", self.id, e))?;
    Ok(SyncQueueRecord {
      id: self.id,
      url: self.url,
      method: self.method,
      headers,
      body: self.body,
      enqueued_at: parse_timestamp(&self.timestamp)?,
      retry_count: self.retry_count,
    })
  }
}

#[derive(Clone)]
pub struct SyncQueue {
  db: Database,
  /// Serializes drains so overlapping triggers don't replay the same record twice
  draining: Arc<tokio::sync::Mutex<()>>,
}

impl SyncQueue {
  pub fn new(db: Database) -> Self {
    Self {
      db,
      draining: Arc::new(tokio::sync::Mutex::new(())),
    }
  }

  /// Persist a failed mutating request. Returns the record id.
  pub fn enqueue(&self, request: &Request) -> Result<i64> {
    if request.is_get() {
      return Err(eyre!("GET requests are never queued for replay"));
    }

    let headers = serde_json::to_string(&request.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let conn = self.db.lock()?;
    conn
      .execute(
        "INSERT INTO sync_queue (url, method, headers, body, timestamp, retry_count)
         VALUES (?, ?, ?, ?, ?, 0)",
        params![
          request.url.as_str(),
          request.method.as_str(),
          headers,
          request.body,
          format_timestamp(Utc::now())
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue {} {}: {}", request.method, request.url, e))?;

    let id = conn.last_insert_rowid();
    info!(id, method = %request.method, url = %request.url, "Queued request for replay");
    Ok(id)
  }

  fn rows(&self) -> Result<Vec<QueueRow>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, url, method, headers, body, timestamp, retry_count
         FROM sync_queue ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok(QueueRow {
          id: row.get(0)?,
          url: row.get(1)?,
          method: row.get(2)?,
          headers: row.get(3)?,
          body: row.get(4)?,
          timestamp: row.get(5)?,
          retry_count: row.get(6)?,
        })
      })
      .map_err(|e| eyre!("Failed to read sync queue: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read sync queue row: {}", e))?;
    Ok(rows)
  }

  /// All readable records in FIFO order. Rows that no longer decode are
  /// skipped here and left in place.
  pub fn records(&self) -> Result<Vec<SyncQueueRecord>> {
    Ok(
      self
        .rows()?
        .into_iter()
        .filter_map(|row| {
          let id = row.id;
          row
            .decode()
            .map_err(|e| warn!(id, error = %e, "Skipping unreadable queued record"))
            .ok()
        })
        .collect(),
    )
  }

  pub fn len(&self) -> Result<usize> {
    let count: i64 = self
      .db
      .lock()?
      .query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count sync queue: {}", e))?;
    Ok(count as usize)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  fn remove(&self, id: i64) -> Result<()> {
    self
      .db
      .lock()?
      .execute("DELETE FROM sync_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove record {}: {}", id, e))?;
    Ok(())
  }

  fn record_failure(&self, id: i64) -> Result<()> {
    self
      .db
      .lock()?
      .execute(
        "UPDATE sync_queue SET retry_count = retry_count + 1 WHERE id = ?",
        params![id],
      )
      .map_err(|e| eyre!("Failed to update record {}: {}", id, e))?;
    Ok(())
  }

  /// Replay every queued record in order.
  ///
  /// A failing record stays queued and does not stop the pass. Each replay is
  /// bounded by `timeout` and `delay` is waited between consecutive records.
  pub async fn drain(
    &self,
    network: &dyn Network,
    delay: Duration,
    timeout: Duration,
  ) -> Result<DrainReport> {
    let _guard = self.draining.lock().await;
    let rows = self.rows()?;
    let mut report = DrainReport::default();

    for (index, row) in rows.into_iter().enumerate() {
      if index > 0 && !delay.is_zero() {
        tokio::time::sleep(delay).await;
      }

      let id = row.id;
      let request = match row.decode().and_then(|record| record.to_request()) {
        Ok(request) => request,
        Err(e) => {
          warn!(id, error = %e, "Queued record cannot be replayed");
          self.record_failure(id)?;
          report.failed += 1;
          continue;
        }
      };

      match tokio::time::timeout(timeout, network.fetch(request)).await {
        Ok(Ok(response)) if response.is_success() => {
          self.remove(id)?;
          debug!(id, status = response.status, "Replayed queued request");
          report.replayed += 1;
        }
        Ok(Ok(response)) => {
          warn!(id, status = response.status, "Replay rejected, keeping record");
          self.record_failure(id)?;
          report.failed += 1;
        }
        Ok(Err(e)) => {
          warn!(id, error = %e, "Replay failed, keeping record");
          self.record_failure(id)?;
          report.failed += 1;
        }
        Err(_) => {
          warn!(id, timeout_ms = timeout.as_millis() as u64, "Replay timed out, keeping record");
          self.record_failure(id)?;
          report.failed += 1;
        }
      }
    }

    report.remaining = self.len()?;
    if report.replayed + report.failed > 0 {
      info!(
        replayed = report.replayed,
        failed = report.failed,
        remaining = report.remaining,
        "Sync queue drained"
      );
    }
    Ok(report)
  }
}
