//! The caching engine.
//!
//! `CachingEngine` owns every piece of engine state (cache store set, sync
//! queue, quota monitor, network and version) and is the single entry point
//! for the host: fetch interception, lifecycle, connectivity and control
//! messages all go through it. Clones share the same state.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{body_digest, CacheNamespace, CacheStats, CacheStore, EngineVersion};
use crate::classify::classify;
use crate::config::Config;
use crate::db::Database;
use crate::event::{EngineEvent, EventBus};
use crate::http::{Request, Response};
use crate::lifecycle::{Lifecycle, LifecycleState, VersionRegistry};
use crate::network::Network;
use crate::offline::{CRISIS_FALLBACK_JSON, CRISIS_RESOURCES, CRISIS_RESOURCES_JSON, OFFLINE_PAGES};
use crate::quota::{QuotaMonitor, SqliteEstimator, StorageEstimator, StorageQuotaSnapshot};
use crate::strategy::{StrategyEngine, StrategySettings};
use crate::sync_queue::{DrainReport, SyncQueue};

const EVENT_CAPACITY: usize = 64;

/// Resources pre-seeded during install, as `namespace:path`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InstallReport {
  pub seeded: Vec<String>,
  pub failed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActivationReport {
  /// Caches of other versions that were deleted
  pub purged: Vec<String>,
  pub crisis: CrisisCheck,
}

/// Result of verifying that the crisis namespace can answer offline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CrisisCheck {
  /// Resources fetched again because the namespace was empty
  pub reseeded: usize,
  /// The hotline JSON had to be stored because nothing could be fetched
  pub synthesized: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageReport {
  #[serde(flatten)]
  pub snapshot: StorageQuotaSnapshot,
  pub namespaces: BTreeMap<String, CacheStats>,
  pub queued: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrisisResourceOutcome {
  pub url: String,
  /// The stored body already had the same digest
  pub unchanged: bool,
  /// Body size
  pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MaintenanceReport {
  pub expired: usize,
  pub crisis: CrisisCheck,
  pub drained: DrainReport,
}

#[derive(Clone)]
pub struct CachingEngine {
  config: Arc<Config>,
  version: EngineVersion,
  caches: CacheStore,
  queue: SyncQueue,
  quota: QuotaMonitor,
  network: Arc<dyn Network>,
  strategies: StrategyEngine,
  lifecycle: Arc<Mutex<Lifecycle>>,
  registry: VersionRegistry,
  events: EventBus,
}

impl CachingEngine {
  /// Engine whose quota is estimated from its own database.
  pub fn new(config: Config, db: Database, network: Arc<dyn Network>) -> Self {
    let estimator = Arc::new(SqliteEstimator::new(db.clone(), config.quota.quota_bytes));
    Self::with_estimator(config, db, network, estimator)
  }

  pub fn with_estimator(
    config: Config,
    db: Database,
    network: Arc<dyn Network>,
    estimator: Arc<dyn StorageEstimator>,
  ) -> Self {
    let version = EngineVersion::new(config.version.clone());
    let caches = CacheStore::new(db.clone(), version.clone());
    let queue = SyncQueue::new(db.clone());
    let quota = QuotaMonitor::new(estimator).with_limits(&config.quota);
    let strategies = StrategyEngine::new(
      config.origin.clone(),
      caches.clone(),
      network.clone(),
      queue.clone(),
      quota.clone(),
      StrategySettings::from_config(&config),
    );

    Self {
      config: Arc::new(config),
      version,
      caches,
      queue,
      quota,
      network,
      strategies,
      lifecycle: Arc::new(Mutex::new(Lifecycle::default())),
      registry: VersionRegistry::new(db),
      events: EventBus::new(EVENT_CAPACITY),
    }
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn version(&self) -> &EngineVersion {
    &self.version
  }

  pub fn caches(&self) -> &CacheStore {
    &self.caches
  }

  pub fn queue(&self) -> &SyncQueue {
    &self.queue
  }

  pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
    self.events.subscribe()
  }

  pub fn state(&self) -> LifecycleState {
    match self.lifecycle.lock() {
      Ok(lifecycle) => lifecycle.state(),
      Err(poisoned) => poisoned.into_inner().state(),
    }
  }

  /// Absolute URL for a path relative to the configured origin.
  pub fn resolve(&self, url: &str) -> Result<Url> {
    Url::parse(url)
      .or_else(|_| self.config.origin.join(url))
      .map_err(|e| eyre!("Invalid URL '{}': {}", url, e))
  }

  // ==========================================================================
  // Fetch interception
  // ==========================================================================

  /// Answer an intercepted request. Never fails.
  ///
  /// Until this version is active every request goes straight to the network.
  pub async fn handle(&self, request: Request) -> Response {
    if !self.state().controls_fetches() {
      debug!(url = %request.url, state = %self.state(), "Not active, passing through");
      return self.strategies.passthrough(request).await;
    }
    let class = classify(&request);
    self.strategies.handle(class, request).await
  }

  /// Replay the sync queue after connectivity returns.
  pub async fn on_connectivity_restored(&self) -> Result<DrainReport> {
    let report = self
      .queue
      .drain(
        self.network.as_ref(),
        self.config.replay_delay(),
        self.config.replay_timeout(),
      )
      .await?;
    self.events.emit(EngineEvent::QueueDrained {
      replayed: report.replayed,
      failed: report.failed,
      remaining: report.remaining,
    });
    Ok(report)
  }

  // ==========================================================================
  // Lifecycle
  // ==========================================================================

  fn lifecycle(&self) -> Result<MutexGuard<'_, Lifecycle>> {
    self
      .lifecycle
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn transition(&self, next: LifecycleState) -> Result<()> {
    let previous = self.lifecycle()?.transition(next)?;
    self.registry.save(self.version.as_str(), next)?;
    info!(version = %self.version, from = %previous, to = %next, "Lifecycle transition");
    self.events.emit(EngineEvent::StateChanged { state: next });
    Ok(())
  }

  /// Resume an already active version, or install and activate this one.
  pub async fn start(&self) -> Result<()> {
    if self.registry.load(self.version.as_str())? == Some(LifecycleState::Active) {
      *self.lifecycle()? = Lifecycle::resumed();
      info!(version = %self.version, "Resumed active version");
      self.events.emit(EngineEvent::StateChanged {
        state: LifecycleState::Active,
      });
      self.ensure_crisis_cache().await?;
      return Ok(());
    }

    let report = self.install().await?;
    if !report.failed.is_empty() {
      warn!(failed = ?report.failed, "Some resources could not be pre-seeded");
    }
    if self.state() == LifecycleState::Waiting {
      self.activate().await?;
    }
    Ok(())
  }

  /// Pre-seed the crisis and critical-fallback namespaces.
  ///
  /// Individual resources that cannot be fetched are reported, not fatal.
  pub async fn install(&self) -> Result<InstallReport> {
    self.transition(LifecycleState::Installing)?;

    let attempts = self.config.install.attempts;
    let seeds = CRISIS_RESOURCES
      .iter()
      .map(|path| (CacheNamespace::Crisis, *path))
      .chain(
        OFFLINE_PAGES
          .iter()
          .map(|path| (CacheNamespace::CriticalFallback, *path)),
      );
    let results = join_all(seeds.map(|(namespace, path)| async move {
      let outcome = self.seed(namespace, path, attempts).await;
      (namespace, path, outcome)
    }))
    .await;

    let mut report = InstallReport::default();
    for (namespace, path, outcome) in results {
      let label = format!("{}:{}", namespace, path);
      match outcome {
        Ok(()) => report.seeded.push(label),
        Err(e) => {
          warn!(cache = %namespace, path, error = %e, "Failed to pre-seed resource");
          report.failed.push(label);
        }
      }
    }
    info!(
      version = %self.version,
      seeded = report.seeded.len(),
      failed = report.failed.len(),
      "Install finished"
    );

    self.transition(LifecycleState::Waiting)?;
    if self.lifecycle()?.skip_waiting_requested() {
      self.activate().await?;
    }
    Ok(report)
  }

  /// Take over from previous versions.
  pub async fn activate(&self) -> Result<ActivationReport> {
    self.transition(LifecycleState::Activating)?;

    let purged = self.caches.purge_stale()?;
    let retired = self.registry.retire_others(self.version.as_str())?;
    if !retired.is_empty() {
      info!(?retired, "Retired previous versions");
    }
    let crisis = self.ensure_crisis_cache().await?;

    self.lifecycle()?.claim_clients();
    self.transition(LifecycleState::Active)?;
    self.events.emit(EngineEvent::ClientsClaimed {
      version: self.version.to_string(),
    });

    Ok(ActivationReport { purged, crisis })
  }

  /// Activate now if waiting; otherwise activate as soon as install finishes.
  pub async fn skip_waiting(&self) -> Result<()> {
    let waiting = {
      let mut lifecycle = self.lifecycle()?;
      lifecycle.request_skip_waiting();
      lifecycle.state() == LifecycleState::Waiting
    };
    if waiting {
      self.activate().await?;
    }
    Ok(())
  }

  /// Stop controlling fetches.
  pub fn retire(&self) -> Result<()> {
    self.transition(LifecycleState::Redundant)
  }

  async fn seed(&self, namespace: CacheNamespace, path: &str, attempts: u32) -> Result<()> {
    let request = Request::get(self.resolve(path)?);
    let cache = self.caches.open(namespace)?;
    let mut last_error = eyre!("No attempts made for {}", path);

    for attempt in 1..=attempts {
      if attempt > 1 {
        tokio::time::sleep(self.config.install_retry_delay()).await;
      }
      match self
        .strategies
        .fetch(request.clone(), None, Some(self.config.crisis_timeout()))
        .await
      {
        Ok(response) if response.is_success() && response.is_cacheable() => {
          cache.put(&request, &response)?;
          debug!(cache = %namespace, path, attempt, "Pre-seeded resource");
          return Ok(());
        }
        Ok(response) => last_error = eyre!("HTTP {}", response.status),
        Err(e) => last_error = e,
      }
      debug!(cache = %namespace, path, attempt, error = %last_error, "Pre-seed attempt failed");
    }
    Err(last_error)
  }

  /// Make sure the crisis namespace is not empty: re-seed it, or store the
  /// hotline JSON when nothing can be fetched.
  async fn ensure_crisis_cache(&self) -> Result<CrisisCheck> {
    let crisis = self.caches.open(CacheNamespace::Crisis)?;
    if !crisis.is_empty()? {
      return Ok(CrisisCheck::default());
    }

    warn!("Crisis cache is empty, re-seeding");
    let results = join_all(
      CRISIS_RESOURCES
        .iter()
        .map(|path| self.seed(CacheNamespace::Crisis, path, 1)),
    )
    .await;
    let reseeded = results.iter().filter(|r| r.is_ok()).count();
    if reseeded > 0 {
      return Ok(CrisisCheck {
        reseeded,
        synthesized: false,
      });
    }

    let request = Request::get(self.resolve(CRISIS_RESOURCES_JSON)?);
    crisis.put(&request, &Response::json(200, CRISIS_FALLBACK_JSON))?;
    warn!(url = %request.url, "Network unavailable, stored fallback crisis resources");
    Ok(CrisisCheck {
      reseeded: 0,
      synthesized: true,
    })
  }

  // ==========================================================================
  // Cache management
  // ==========================================================================

  /// Entry count and size per namespace.
  pub fn cache_status(&self) -> Result<BTreeMap<String, CacheStats>> {
    CacheNamespace::ALL
      .iter()
      .map(|ns| Ok((ns.to_string(), self.caches.open(*ns)?.stats()?)))
      .collect()
  }

  pub fn storage_report(&self) -> Result<StorageReport> {
    Ok(StorageReport {
      snapshot: self.quota.snapshot()?,
      namespaces: self.cache_status()?,
      queued: self.queue.len()?,
    })
  }

  /// Delete a namespace. The crisis namespace is rejected.
  pub fn clear_cache(&self, namespace: CacheNamespace) -> Result<bool> {
    let removed = self.caches.delete(namespace)?;
    info!(cache = %namespace, removed, "Cleared cache");
    Ok(removed)
  }

  /// Fetch a same-origin resource into the crisis namespace.
  pub async fn cache_crisis_resource(&self, url: &str) -> Result<CrisisResourceOutcome> {
    let target = self.resolve(url)?;
    if target.origin() != self.config.origin.origin() {
      return Err(eyre!("Crisis resources must be same-origin: {}", target));
    }

    let request = Request::get(target);
    let response = self
      .strategies
      .fetch(request.clone(), None, Some(self.config.crisis_timeout()))
      .await?;
    if !(response.is_success() && response.is_cacheable()) {
      return Err(eyre!("Fetching {} returned HTTP {}", request.url, response.status));
    }

    let cache = self.caches.open(CacheNamespace::Crisis)?;
    let digest = body_digest(&response.body);
    let unchanged = cache
      .match_request(&request)?
      .is_some_and(|entry| entry.digest() == digest);
    if !unchanged {
      cache.put(&request, &response)?;
      info!(url = %request.url, bytes = response.body.len(), "Cached crisis resource");
    }

    Ok(CrisisResourceOutcome {
      url: request.cache_url(),
      unchanged,
      bytes: response.body.len() as u64,
    })
  }

  /// Expiration sweep over every namespace, crisis check and queue drain.
  pub async fn maintenance(&self) -> Result<MaintenanceReport> {
    let now = Utc::now();
    let mut expired = 0;
    for namespace in CacheNamespace::ALL {
      expired += self.caches.open(namespace)?.expire(now)?;
    }
    let crisis = self.ensure_crisis_cache().await?;
    let drained = self.on_connectivity_restored().await?;

    info!(expired, "Cache maintenance finished");
    Ok(MaintenanceReport {
      expired,
      crisis,
      drained,
    })
  }
}
