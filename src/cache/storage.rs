//! SQLite-backed cache store set.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use super::entry::{CacheStats, CachedEntry};
use super::namespace::{CacheNamespace, EngineVersion};
use crate::db::{format_timestamp, parse_timestamp, Database};
use crate::http::{Request, Response};

/// The fixed collection of versioned caches.
#[derive(Clone)]
pub struct CacheStore {
  db: Database,
  version: EngineVersion,
}

impl CacheStore {
  pub fn new(db: Database, version: EngineVersion) -> Self {
    Self { db, version }
  }

  /// Open (creating if needed) the current version's cache for a namespace.
  ///
  /// Idempotent; concurrent callers all receive handles to the same cache.
  pub fn open(&self, namespace: CacheNamespace) -> Result<CacheHandle> {
    let name = self.version.cache_name(namespace);
    self
      .db
      .lock()?
      .execute(
        "INSERT OR IGNORE INTO cache_namespaces (name, created_at) VALUES (?, ?)",
        params![name, format_timestamp(Utc::now())],
      )
      .map_err(|e| eyre!("Failed to open cache {}: {}", name, e))?;

    Ok(CacheHandle {
      db: self.db.clone(),
      namespace,
      name,
    })
  }

  /// Names of every cache present in storage, any version.
  pub fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT name FROM cache_namespaces
         UNION SELECT DISTINCT namespace FROM cache_entries
         ORDER BY 1",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;
    Ok(names)
  }

  /// Delete a current-version namespace entirely. The crisis namespace is
  /// never deletable through this path.
  pub fn delete(&self, namespace: CacheNamespace) -> Result<bool> {
    if namespace == CacheNamespace::Crisis {
      return Err(eyre!("The crisis cache cannot be deleted"));
    }
    self.delete_by_name(&self.version.cache_name(namespace))
  }

  /// Delete every cache that does not belong to the current version.
  pub fn purge_stale(&self) -> Result<Vec<String>> {
    let known = self.version.known_cache_names();
    let stale: Vec<String> = self
      .cache_names()?
      .into_iter()
      .filter(|name| !known.contains(name))
      .collect();

    for name in &stale {
      self.delete_by_name(name)?;
      info!(cache = %name, "Deleted stale cache");
    }
    Ok(stale)
  }

  fn delete_by_name(&self, name: &str) -> Result<bool> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM cache_entries WHERE namespace = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM cache_namespaces WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(removed > 0)
  }
}

/// Handle to one namespace of the current version.
#[derive(Clone)]
pub struct CacheHandle {
  db: Database,
  namespace: CacheNamespace,
  name: String,
}

impl CacheHandle {
  /// Look up the stored response for a request.
  ///
  /// An entry that cannot be decoded is deleted and reported as a miss.
  pub fn match_request(&self, request: &Request) -> Result<Option<CachedEntry>> {
    let method = request.method.as_str();
    let url = request.cache_url();

    let row: Option<(u16, String, Vec<u8>, String)> = self
      .db
      .lock()?
      .query_row(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE namespace = ? AND method = ? AND url = ?",
        params![self.name, method, url],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry {}: {}", url, e))?;

    let Some((status, headers, body, cached_at)) = row else {
      return Ok(None);
    };

    match decode(&headers, &cached_at) {
      Ok((headers, cached_at)) => Ok(Some(CachedEntry {
        method: method.to_string(),
        url,
        response: Response {
          status,
          headers,
          body,
        },
        cached_at,
      })),
      Err(e) => {
        warn!(cache = %self.name, url = %url, error = %e, "Dropping corrupt cache entry");
        self.remove(method, &url)?;
        Ok(None)
      }
    }
  }

  /// Store a response. Only GET responses with status 0 or 200 are accepted.
  pub fn put(&self, request: &Request, response: &Response) -> Result<()> {
    self.put_at(request, response, Utc::now())
  }

  pub(crate) fn put_at(
    &self,
    request: &Request,
    response: &Response,
    cached_at: DateTime<Utc>,
  ) -> Result<()> {
    if !request.is_get() {
      return Err(eyre!("Only GET responses can be cached, got {}", request.method));
    }
    if !response.is_cacheable() {
      return Err(eyre!("Response status {} is not cacheable", response.status));
    }

    let url = request.cache_url();
    let stored = response.clone().without_source();
    let headers = serde_json::to_string(&stored.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;
    let cached_at = format_timestamp(cached_at);

    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    // A handle may outlive a namespace deletion; writing recreates it
    tx.execute(
      "INSERT OR IGNORE INTO cache_namespaces (name, created_at) VALUES (?, ?)",
      params![self.name, cached_at],
    )
    .map_err(|e| eyre!("Failed to register cache {}: {}", self.name, e))?;

    tx.execute(
      "INSERT OR REPLACE INTO cache_entries (namespace, method, url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        self.name,
        request.method.as_str(),
        url,
        stored.status,
        headers,
        stored.body,
        cached_at
      ],
    )
    .map_err(|e| eyre!("Failed to store cache entry {}: {}", url, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    debug!(cache = %self.name, url = %url, "Cached response");
    Ok(())
  }

  /// Remove the entry for a request.
  ///
  /// Refused when it would leave the crisis namespace empty.
  pub fn delete(&self, request: &Request) -> Result<bool> {
    let method = request.method.as_str();
    let url = request.cache_url();

    if self.namespace == CacheNamespace::Crisis && self.len()? <= 1 && self.contains(method, &url)? {
      return Err(eyre!("Refusing to remove the last crisis cache entry"));
    }
    self.remove(method, &url)
  }

  /// URLs of every entry, oldest first.
  pub fn keys(&self) -> Result<Vec<String>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare("SELECT url FROM cache_entries WHERE namespace = ? ORDER BY cached_at, url")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![self.name], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list keys of {}: {}", self.name, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read key: {}", e))?;
    Ok(keys)
  }

  pub fn len(&self) -> Result<usize> {
    Ok(self.stats()?.entries)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  /// Entry count and approximate byte size.
  pub fn stats(&self) -> Result<CacheStats> {
    let (entries, bytes): (i64, i64) = self
      .db
      .lock()?
      .query_row(
        "SELECT COUNT(*), COALESCE(SUM(LENGTH(body) + LENGTH(headers) + LENGTH(url)), 0)
         FROM cache_entries WHERE namespace = ?",
        params![self.name],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .map_err(|e| eyre!("Failed to compute stats of {}: {}", self.name, e))?;

    Ok(CacheStats {
      entries: entries as usize,
      bytes: bytes as u64,
    })
  }

  /// Apply the namespace's expiration policy. Returns the number of entries evicted.
  pub fn expire(&self, now: DateTime<Utc>) -> Result<usize> {
    let policy = self.namespace.expiration();
    let conn = self.db.lock()?;
    let mut evicted = 0;

    if let Some(max_age) = policy.max_age {
      evicted += conn
        .execute(
          "DELETE FROM cache_entries WHERE namespace = ? AND cached_at < ?",
          params![self.name, format_timestamp(now - max_age)],
        )
        .map_err(|e| eyre!("Failed to expire entries of {}: {}", self.name, e))?;
    }

    if let Some(max_entries) = policy.max_entries {
      // Keep the newest max_entries rows
      evicted += conn
        .execute(
          "DELETE FROM cache_entries WHERE namespace = ?1 AND rowid IN (
             SELECT rowid FROM cache_entries WHERE namespace = ?1
             ORDER BY cached_at DESC LIMIT -1 OFFSET ?2
           )",
          params![self.name, max_entries as i64],
        )
        .map_err(|e| eyre!("Failed to trim entries of {}: {}", self.name, e))?;
    }

    if evicted > 0 {
      debug!(cache = %self.name, evicted, "Expired cache entries");
    }
    Ok(evicted)
  }

  fn contains(&self, method: &str, url: &str) -> Result<bool> {
    let found: Option<i64> = self
      .db
      .lock()?
      .query_row(
        "SELECT 1 FROM cache_entries WHERE namespace = ? AND method = ? AND url = ?",
        params![self.name, method, url],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry {}: {}", url, e))?;
    Ok(found.is_some())
  }

  fn remove(&self, method: &str, url: &str) -> Result<bool> {
    let removed = self
      .db
      .lock()?
      .execute(
        "DELETE FROM cache_entries WHERE namespace = ? AND method = ? AND url = ?",
        params![self.name, method, url],
      )
      .map_err(|e| eyre!("Failed to delete cache entry {}: {}", url, e))?;
    Ok(removed > 0)
  }
}

fn decode(headers: &str, cached_at: &str) -> Result<(BTreeMap<String, String>, DateTime<Utc>)> {
  let headers = serde_json::from_str(headers)
    .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
  Ok((headers, parse_timestamp(cached_at)?))
}
