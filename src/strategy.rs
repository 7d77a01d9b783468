//! Fetch strategies.
//!
//! Each resource class maps to one strategy over one cache namespace:
//!
//! - **cache-first**: serve an unexpired cache entry, otherwise fetch and store
//! - **network-first**: fetch with a per-class timeout, otherwise serve the cache
//! - **stale-while-revalidate**: serve the cache immediately, refreshing stale entries in the background
//! - **network-only**: fetch, never store
//!
//! Fetches run as spawned tasks. When a timeout fires the caller gets its
//! fallback right away while the task keeps running; if it later succeeds its
//! response still lands in the cache. Nothing here returns an error to the
//! host: every failure path ends in a cached, pre-seeded or synthesized
//! response. Entries past their namespace's max age are still served when the
//! network cannot answer; only maintenance sweeps remove them.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheNamespace, CacheStore, CachedEntry};
use crate::classify::{is_api_path, is_crisis_path, ResourceClass};
use crate::config::Config;
use crate::http::{Request, Response, ResponseSource};
use crate::network::Network;
use crate::offline::{self, OFFLINE_CRISIS_PAGE, OFFLINE_PAGE};
use crate::quota::QuotaMonitor;
use crate::sync_queue::SyncQueue;

/// How a request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  CacheFirst {
    timeout: Option<Duration>,
    revalidate: bool,
  },
  NetworkFirst {
    timeout: Option<Duration>,
  },
  StaleWhileRevalidate,
  NetworkOnly {
    timeout: Option<Duration>,
  },
}

/// Strategy and target cache chosen for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
  pub strategy: Strategy,
  /// Cache to read from and populate; `None` for uncached requests
  pub namespace: Option<CacheNamespace>,
}

/// Per-class timeouts and freshness window.
#[derive(Debug, Clone, Copy)]
pub struct StrategySettings {
  pub api_timeout: Duration,
  pub critical_api_timeout: Duration,
  pub crisis_timeout: Duration,
  pub freshness: chrono::Duration,
}

impl StrategySettings {
  pub fn from_config(config: &Config) -> Self {
    Self {
      api_timeout: config.api_timeout(),
      critical_api_timeout: config.critical_api_timeout(),
      crisis_timeout: config.crisis_timeout(),
      freshness: config.freshness(),
    }
  }

  /// Select the strategy for a classified request.
  pub fn plan(&self, class: ResourceClass, request: &Request) -> Plan {
    let critical_api = class == ResourceClass::Crisis && is_api_path(&request.path().to_ascii_lowercase());

    if !request.is_get() {
      let timeout = match class {
        _ if critical_api => Some(self.critical_api_timeout),
        ResourceClass::Crisis => Some(self.crisis_timeout),
        ResourceClass::Api => Some(self.api_timeout),
        _ => None,
      };
      return Plan {
        strategy: Strategy::NetworkOnly { timeout },
        namespace: None,
      };
    }

    match class {
      _ if critical_api => Plan {
        strategy: Strategy::NetworkFirst {
          timeout: Some(self.critical_api_timeout),
        },
        namespace: Some(CacheNamespace::Api),
      },
      ResourceClass::Crisis => Plan {
        strategy: Strategy::CacheFirst {
          timeout: Some(self.crisis_timeout),
          revalidate: true,
        },
        namespace: Some(CacheNamespace::Crisis),
      },
      ResourceClass::Api => Plan {
        strategy: Strategy::NetworkFirst {
          timeout: Some(self.api_timeout),
        },
        namespace: Some(CacheNamespace::Api),
      },
      ResourceClass::Video => Plan {
        strategy: Strategy::CacheFirst {
          timeout: None,
          revalidate: false,
        },
        namespace: Some(CacheNamespace::Video),
      },
      ResourceClass::Image => Plan {
        strategy: Strategy::CacheFirst {
          timeout: None,
          revalidate: false,
        },
        namespace: Some(CacheNamespace::Images),
      },
      ResourceClass::Navigation => Plan {
        strategy: Strategy::NetworkFirst { timeout: None },
        namespace: None,
      },
      ResourceClass::Other => Plan {
        strategy: Strategy::StaleWhileRevalidate,
        namespace: Some(CacheNamespace::Community),
      },
    }
  }
}

/// Executes strategies against the cache store set and the network.
#[derive(Clone)]
pub struct StrategyEngine {
  /// Origin the offline pages were seeded under
  origin: Url,
  caches: CacheStore,
  network: Arc<dyn Network>,
  queue: SyncQueue,
  quota: QuotaMonitor,
  settings: StrategySettings,
}

impl StrategyEngine {
  pub fn new(
    origin: Url,
    caches: CacheStore,
    network: Arc<dyn Network>,
    queue: SyncQueue,
    quota: QuotaMonitor,
    settings: StrategySettings,
  ) -> Self {
    Self {
      origin,
      caches,
      network,
      queue,
      quota,
      settings,
    }
  }

  /// Serve a classified request. Never fails.
  pub async fn handle(&self, class: ResourceClass, request: Request) -> Response {
    let plan = self.settings.plan(class, &request);
    debug!(class = %class, method = %request.method, url = %request.url, ?plan, "Handling request");

    if !request.is_get() {
      return self.send_mutating(plan, request).await;
    }

    let outcome = match (plan.strategy, plan.namespace) {
      (Strategy::CacheFirst { timeout, revalidate }, Some(ns)) => {
        self.cache_first(ns, &request, timeout, revalidate).await
      }
      (Strategy::NetworkFirst { timeout }, Some(ns)) => {
        self.network_first(ns, &request, timeout).await
      }
      (Strategy::StaleWhileRevalidate, Some(ns)) => self.stale_while_revalidate(ns, &request).await,
      (Strategy::NetworkFirst { timeout }, None) | (Strategy::NetworkOnly { timeout }, _) => self
        .fetch(request.clone(), None, timeout)
        .await
        .map(|r| r.with_source(ResponseSource::Network)),
      (strategy, None) => Err(eyre!("{:?} requires a cache namespace", strategy)),
    };

    match outcome {
      // Crisis requests prefer a stored or synthesized answer over a server error
      Ok(response) if class == ResourceClass::Crisis && response.status >= 400 => {
        warn!(url = %request.url, status = response.status, "Crisis resource returned an error status");
        plan
          .namespace
          .and_then(|ns| self.lookup(ns, &request))
          .map(|entry| entry.into_response(ResponseSource::CacheStale))
          .unwrap_or_else(|| self.crisis_fallback(&request))
      }
      Ok(response) => response,
      Err(e) => {
        warn!(class = %class, url = %request.url, error = %e, "Falling back to offline response");
        self.fallback(class, &request)
      }
    }
  }

  /// Requests arriving before the engine is active go straight to the network.
  pub async fn passthrough(&self, request: Request) -> Response {
    match self.fetch(request.clone(), None, None).await {
      Ok(response) => response.with_source(ResponseSource::Network),
      Err(e) => {
        warn!(url = %request.url, error = %e, "Passthrough fetch failed");
        if request.is_get() {
          offline::service_unavailable("The network is unavailable.")
        } else {
          offline::not_queued()
        }
      }
    }
  }

  // ==========================================================================
  // Strategies
  // ==========================================================================

  async fn cache_first(
    &self,
    namespace: CacheNamespace,
    request: &Request,
    timeout: Option<Duration>,
    revalidate: bool,
  ) -> Result<Response> {
    let cached = self.lookup(namespace, request);
    let expired = cached
      .as_ref()
      .is_some_and(|entry| namespace.expiration().is_expired(entry.cached_at, Utc::now()));

    match cached {
      Some(entry) if !expired => {
        debug!(cache = %namespace, url = %entry.url, "Cache hit");
        if revalidate {
          self.revalidate(namespace, request.clone(), timeout);
        }
        Ok(entry.into_response(ResponseSource::Cache))
      }
      cached => {
        debug!(cache = %namespace, url = %request.url, expired, "Cache miss");
        match self.fetch(request.clone(), Some(namespace), timeout).await {
          Ok(response) => Ok(response.with_source(ResponseSource::Network)),
          // An expired copy beats no copy
          Err(e) => match cached {
            Some(entry) => {
              debug!(cache = %namespace, url = %entry.url, error = %e, "Network failed, serving expired entry");
              Ok(entry.into_response(ResponseSource::CacheStale))
            }
            None => Err(e),
          },
        }
      }
    }
  }

  async fn network_first(
    &self,
    namespace: CacheNamespace,
    request: &Request,
    timeout: Option<Duration>,
  ) -> Result<Response> {
    match self.fetch(request.clone(), Some(namespace), timeout).await {
      Ok(response) => Ok(response.with_source(ResponseSource::Network)),
      Err(e) => match self.lookup(namespace, request) {
        Some(entry) => {
          debug!(cache = %namespace, url = %entry.url, error = %e, "Network failed, serving cache");
          Ok(entry.into_response(ResponseSource::CacheStale))
        }
        None => Err(e),
      },
    }
  }

  async fn stale_while_revalidate(
    &self,
    namespace: CacheNamespace,
    request: &Request,
  ) -> Result<Response> {
    if let Some(entry) = self.lookup(namespace, request) {
      if entry.age(Utc::now()) > self.settings.freshness {
        self.revalidate(namespace, request.clone(), None);
        return Ok(entry.into_response(ResponseSource::CacheStale));
      }
      return Ok(entry.into_response(ResponseSource::Cache));
    }

    let response = self.fetch(request.clone(), Some(namespace), None).await?;
    Ok(response.with_source(ResponseSource::Network))
  }

  async fn send_mutating(&self, plan: Plan, request: Request) -> Response {
    let timeout = match plan.strategy {
      Strategy::NetworkOnly { timeout } => timeout,
      _ => None,
    };

    match self.fetch(request.clone(), None, timeout).await {
      Ok(response) if response.is_success() => response.with_source(ResponseSource::Network),
      Ok(response) => {
        warn!(url = %request.url, status = response.status, "Mutating request rejected");
        self.enqueue(&request)
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "Mutating request failed");
        self.enqueue(&request)
      }
    }
  }

  fn enqueue(&self, request: &Request) -> Response {
    match self.queue.enqueue(request) {
      Ok(id) => offline::queued(id),
      Err(e) => {
        warn!(url = %request.url, error = %e, "Could not persist request for replay");
        offline::not_queued()
      }
    }
  }

  // ==========================================================================
  // Network
  // ==========================================================================

  /// Fetch on a detached task, storing a cacheable result in `store_in`.
  ///
  /// On timeout the task is left running so its response still reaches the
  /// cache.
  pub(crate) async fn fetch(
    &self,
    request: Request,
    store_in: Option<CacheNamespace>,
    timeout: Option<Duration>,
  ) -> Result<Response> {
    let task = self.spawn_fetch(request, store_in);

    let joined = match timeout {
      Some(limit) => tokio::time::timeout(limit, task)
        .await
        .map_err(|_| eyre!("Network timed out after {}ms", limit.as_millis()))?,
      None => task.await,
    };

    joined.map_err(|e| eyre!("Fetch task failed: {}", e))?
  }

  fn spawn_fetch(
    &self,
    request: Request,
    store_in: Option<CacheNamespace>,
  ) -> JoinHandle<Result<Response>> {
    let this = self.clone();
    tokio::spawn(async move {
      let response = this.network.fetch(request.clone()).await?;
      if let Some(namespace) = store_in {
        this.store(namespace, &request, &response);
      }
      Ok::<_, color_eyre::Report>(response)
    })
  }

  /// Refresh an entry in the background. The result only feeds the cache.
  fn revalidate(&self, namespace: CacheNamespace, request: Request, timeout: Option<Duration>) {
    let task = self.spawn_fetch(request.clone(), Some(namespace));
    tokio::spawn(async move {
      let outcome = match timeout {
        Some(limit) => tokio::time::timeout(limit, task).await.ok(),
        None => Some(task.await),
      };
      match outcome {
        Some(Ok(Ok(_))) => debug!(cache = %namespace, url = %request.url, "Revalidated"),
        _ => debug!(cache = %namespace, url = %request.url, "Revalidation did not complete"),
      }
    });
  }

  // ==========================================================================
  // Cache access
  // ==========================================================================

  /// Stored entry for a request, whatever its age. Storage errors count as
  /// a miss.
  fn lookup(&self, namespace: CacheNamespace, request: &Request) -> Option<CachedEntry> {
    let handle = match self.caches.open(namespace) {
      Ok(handle) => handle,
      Err(e) => {
        warn!(cache = %namespace, error = %e, "Cache unavailable");
        return None;
      }
    };

    handle.match_request(request).unwrap_or_else(|e| {
      warn!(cache = %namespace, url = %request.url, error = %e, "Cache read failed");
      None
    })
  }

  /// Best-effort cache write; failures are logged, never surfaced.
  fn store(&self, namespace: CacheNamespace, request: &Request, response: &Response) {
    if !request.is_get() || !response.is_cacheable() {
      return;
    }
    if namespace == CacheNamespace::Video
      && !self
        .quota
        .should_accept_large_write(response.body.len() as u64)
    {
      debug!(url = %request.url, bytes = response.body.len(), "Skipping video cache write");
      return;
    }

    let result = self.caches.open(namespace).and_then(|handle| {
      handle.put(request, response)?;
      handle.expire(Utc::now())
    });
    if let Err(e) = result {
      warn!(cache = %namespace, url = %request.url, error = %e, "Cache write failed");
    }
  }

  // ==========================================================================
  // Fallbacks
  // ==========================================================================

  fn fallback(&self, class: ResourceClass, request: &Request) -> Response {
    match class {
      ResourceClass::Crisis => self.crisis_fallback(request),
      ResourceClass::Navigation => self.navigation_fallback(request),
      _ => offline::service_unavailable("This content is not available offline."),
    }
  }

  /// Crisis data when neither network nor cache can answer: the offline
  /// crisis page for documents, the hotline JSON otherwise.
  fn crisis_fallback(&self, request: &Request) -> Response {
    if request.wants_json() || is_api_path(&request.path().to_ascii_lowercase()) {
      return offline::crisis_fallback();
    }
    self
      .offline_page(OFFLINE_CRISIS_PAGE)
      .unwrap_or_else(offline::crisis_fallback)
  }

  fn navigation_fallback(&self, request: &Request) -> Response {
    let crisis_related = is_crisis_path(&request.path().to_ascii_lowercase());
    crisis_related
      .then(|| self.offline_page(OFFLINE_CRISIS_PAGE))
      .flatten()
      .or_else(|| self.offline_page(OFFLINE_PAGE))
      .unwrap_or_else(offline::minimal_offline_page)
  }

  /// A pre-seeded offline page from critical-fallback, or crisis for the crisis page.
  fn offline_page(&self, path: &str) -> Option<Response> {
    let request = Request::get(self.origin.join(path).ok()?);
    let namespaces: &[CacheNamespace] = if path == OFFLINE_CRISIS_PAGE {
      &[CacheNamespace::CriticalFallback, CacheNamespace::Crisis]
    } else {
      &[CacheNamespace::CriticalFallback]
    };

    namespaces
      .iter()
      .find_map(|ns| self.lookup(*ns, &request))
      .map(|entry| entry.into_response(ResponseSource::Fallback))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::EngineVersion;
  use crate::db::Database;
  use crate::http::{Destination, Method, RequestMode};
  use crate::network::scripted::ScriptedNetwork;
  use crate::offline::CRISIS_FALLBACK_JSON;
  use crate::quota::fixed::FixedEstimator;
  use std::time::Instant;

  const ORIGIN: &str = "https://app.test";

  fn settings() -> StrategySettings {
    StrategySettings {
      api_timeout: Duration::from_millis(100),
      critical_api_timeout: Duration::from_millis(200),
      crisis_timeout: Duration::from_millis(300),
      freshness: chrono::Duration::minutes(15),
    }
  }

  struct Harness {
    engine: StrategyEngine,
    network: ScriptedNetwork,
    caches: CacheStore,
    queue: SyncQueue,
    estimator: Arc<FixedEstimator>,
  }

  fn harness() -> Harness {
    let db = Database::open_in_memory().unwrap();
    let caches = CacheStore::new(db.clone(), EngineVersion::new("test"));
    let queue = SyncQueue::new(db);
    let network = ScriptedNetwork::new();
    let estimator = FixedEstimator::new(0, 1 << 30);
    let engine = StrategyEngine::new(
      Url::parse(ORIGIN).unwrap(),
      caches.clone(),
      Arc::new(network.clone()),
      queue.clone(),
      QuotaMonitor::new(estimator.clone()),
      settings(),
    );
    Harness {
      engine,
      network,
      caches,
      queue,
      estimator,
    }
  }

  fn get(path: &str) -> Request {
    Request::get(Url::parse(ORIGIN).unwrap().join(path).unwrap())
  }

  fn post(path: &str) -> Request {
    Request::new(Method::POST, Url::parse(ORIGIN).unwrap().join(path).unwrap()).with_body("{}")
  }

  // ==========================================================================
  // Plans
  // ==========================================================================

  #[test]
  fn test_plan_per_class() {
    let s = settings();
    assert_eq!(
      s.plan(ResourceClass::Crisis, &get("/crisis")),
      Plan {
        strategy: Strategy::CacheFirst {
          timeout: Some(s.crisis_timeout),
          revalidate: true
        },
        namespace: Some(CacheNamespace::Crisis),
      }
    );
    assert_eq!(
      s.plan(ResourceClass::Api, &get("/api/moods")).strategy,
      Strategy::NetworkFirst {
        timeout: Some(s.api_timeout)
      }
    );
    assert_eq!(
      s.plan(ResourceClass::Other, &get("/community")).namespace,
      Some(CacheNamespace::Community)
    );
    assert_eq!(
      s.plan(ResourceClass::Navigation, &get("/journal")).namespace,
      None
    );
  }

  #[test]
  fn test_crisis_api_uses_critical_timeout() {
    let s = settings();
    let plan = s.plan(ResourceClass::Crisis, &get("/api/safety-plan"));
    assert_eq!(
      plan.strategy,
      Strategy::NetworkFirst {
        timeout: Some(s.critical_api_timeout)
      }
    );
    assert_eq!(plan.namespace, Some(CacheNamespace::Api));
  }

  #[test]
  fn test_mutating_requests_are_never_cached() {
    let s = settings();
    let plan = s.plan(ResourceClass::Api, &post("/api/moods"));
    assert_eq!(
      plan,
      Plan {
        strategy: Strategy::NetworkOnly {
          timeout: Some(s.api_timeout)
        },
        namespace: None
      }
    );
  }

  // ==========================================================================
  // Execution
  // ==========================================================================

  #[tokio::test]
  async fn test_network_first_times_out_to_cache_then_stores_late_response() {
    let h = harness();
    let api = h.caches.open(CacheNamespace::Api).unwrap();
    api
      .put(&get("/api/moods"), &Response::json(200, "[1]"))
      .unwrap();
    h.network.respond_after(
      "/api/moods",
      Duration::from_millis(250),
      Response::json(200, "[1,2]"),
    );

    let started = Instant::now();
    let response = h.engine.handle(ResourceClass::Api, get("/api/moods")).await;
    let elapsed = started.elapsed();

    assert_eq!(response.body, b"[1]");
    assert_eq!(response.source(), Some("cache-stale"));
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(240), "took {:?}", elapsed);

    // The abandoned fetch still refreshes the cache
    tokio::time::sleep(Duration::from_millis(300)).await;
    let entry = api.match_request(&get("/api/moods")).unwrap().unwrap();
    assert_eq!(entry.response.body, b"[1,2]");
  }

  #[tokio::test]
  async fn test_hanging_api_without_cache_returns_503_in_time() {
    let h = harness();
    h.network.hang("/api/moods");

    let started = Instant::now();
    let response = h.engine.handle(ResourceClass::Api, get("/api/moods")).await;

    assert_eq!(response.status, 503);
    assert!(started.elapsed() < Duration::from_millis(200));
  }

  #[tokio::test]
  async fn test_crisis_cache_hit_revalidates_in_background() {
    let h = harness();
    let crisis = h.caches.open(CacheNamespace::Crisis).unwrap();
    crisis
      .put(&get("/safety-plan"), &Response::html(200, "old plan"))
      .unwrap();
    h.network
      .respond("/safety-plan", Response::html(200, "new plan"));

    let response = h.engine.handle(ResourceClass::Crisis, get("/safety-plan")).await;
    assert_eq!(response.body, b"old plan");
    assert_eq!(response.source(), Some("cache"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let entry = crisis.match_request(&get("/safety-plan")).unwrap().unwrap();
    assert_eq!(entry.response.body, b"new plan");
  }

  #[tokio::test]
  async fn test_crisis_json_miss_offline_is_synthesized() {
    let h = harness();
    h.network.set_offline(true);

    let response = h
      .engine
      .handle(ResourceClass::Crisis, get("/crisis-resources.json"))
      .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, CRISIS_FALLBACK_JSON.as_bytes());
  }

  #[tokio::test]
  async fn test_crisis_page_miss_serves_offline_crisis_page() {
    let h = harness();
    h.caches
      .open(CacheNamespace::CriticalFallback)
      .unwrap()
      .put(&get(OFFLINE_CRISIS_PAGE), &Response::html(200, "call 988"))
      .unwrap();
    h.network.set_offline(true);

    let response = h.engine.handle(ResourceClass::Crisis, get("/emergency")).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"call 988");
    assert_eq!(response.source(), Some("fallback"));
  }

  #[tokio::test]
  async fn test_hanging_crisis_resource_falls_back_after_crisis_timeout() {
    let h = harness();
    h.network.hang("/crisis-resources.json");

    let started = Instant::now();
    let response = h
      .engine
      .handle(ResourceClass::Crisis, get("/crisis-resources.json"))
      .await;
    let elapsed = started.elapsed();

    assert_eq!(response.status, 200);
    assert_eq!(response.body, CRISIS_FALLBACK_JSON.as_bytes());
    assert!(elapsed >= Duration::from_millis(300), "took {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(450), "took {:?}", elapsed);
  }

  #[tokio::test]
  async fn test_hanging_critical_api_falls_back_after_critical_timeout() {
    let h = harness();
    h.network.hang("/api/crisis-report");

    let started = Instant::now();
    let response = h
      .engine
      .handle(ResourceClass::Crisis, get("/api/crisis-report"))
      .await;
    let elapsed = started.elapsed();

    assert_eq!(response.status, 200);
    assert_eq!(response.body, CRISIS_FALLBACK_JSON.as_bytes());
    assert!(elapsed >= Duration::from_millis(200), "took {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(300), "took {:?}", elapsed);
  }

  #[tokio::test]
  async fn test_hanging_critical_api_serves_api_cache() {
    let h = harness();
    h.caches
      .open(CacheNamespace::Api)
      .unwrap()
      .put(&get("/api/crisis-report"), &Response::json(200, r#"{"open":true}"#))
      .unwrap();
    h.network.hang("/api/crisis-report");

    let started = Instant::now();
    let response = h
      .engine
      .handle(ResourceClass::Crisis, get("/api/crisis-report"))
      .await;

    assert_eq!(response.body, br#"{"open":true}"#);
    assert_eq!(response.source(), Some("cache-stale"));
    assert!(started.elapsed() >= Duration::from_millis(200));
  }

  #[tokio::test]
  async fn test_crisis_server_error_falls_back() {
    let h = harness();
    h.network.respond("/crisis-resources.json", Response::new(500));

    let response = h
      .engine
      .handle(ResourceClass::Crisis, get("/crisis-resources.json"))
      .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, CRISIS_FALLBACK_JSON.as_bytes());
  }

  #[tokio::test]
  async fn test_failed_post_is_queued() {
    let h = harness();
    h.network.set_offline(true);

    let response = h.engine.handle(ResourceClass::Api, post("/api/moods")).await;
    assert_eq!(response.status, 202);
    assert_eq!(response.source(), Some("queued"));
    assert_eq!(h.queue.len().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_client_error_post_is_queued() {
    let h = harness();
    h.network.respond("/api/moods", Response::new(422));

    let response = h.engine.handle(ResourceClass::Api, post("/api/moods")).await;
    assert_eq!(response.status, 202);
    assert_eq!(response.source(), Some("queued"));
    assert_eq!(h.queue.len().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_successful_post_is_not_queued() {
    let h = harness();
    h.network.respond("/api/moods", Response::new(201));

    let response = h.engine.handle(ResourceClass::Api, post("/api/moods")).await;
    assert_eq!(response.status, 201);
    assert_eq!(response.source(), Some("network"));
    assert!(h.queue.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_server_error_post_is_queued() {
    let h = harness();
    h.network.respond("/api/moods", Response::new(502));

    let response = h.engine.handle(ResourceClass::Api, post("/api/moods")).await;
    assert_eq!(response.status, 202);
    assert_eq!(h.queue.len().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_queue_failure_reports_not_queued() {
    let db = Database::open_in_memory().unwrap();
    db.lock().unwrap().execute_batch("DROP TABLE sync_queue").unwrap();
    let network = ScriptedNetwork::new();
    network.set_offline(true);
    let engine = StrategyEngine::new(
      Url::parse(ORIGIN).unwrap(),
      CacheStore::new(db.clone(), EngineVersion::new("test")),
      Arc::new(network),
      SyncQueue::new(db),
      QuotaMonitor::new(FixedEstimator::new(0, 1 << 30)),
      settings(),
    );

    let response = engine.handle(ResourceClass::Api, post("/api/moods")).await;
    assert_eq!(response.status, 503);
    assert_ne!(response.source(), Some("queued"));
  }

  #[tokio::test]
  async fn test_video_cached_only_when_quota_allows() {
    let h = harness();
    let video = get("/videos/breathing.mp4").with_destination(Destination::Video);
    h.network
      .respond("/videos/breathing.mp4", Response::new(200).with_body(vec![1u8; 2048]));

    // Storage nearly full: served but not stored
    h.estimator.set(95, 100);
    let response = h.engine.handle(ResourceClass::Video, video.clone()).await;
    assert_eq!(response.status, 200);
    let cache = h.caches.open(CacheNamespace::Video).unwrap();
    assert!(cache.is_empty().unwrap());

    h.estimator.set(0, 1 << 30);
    h.engine.handle(ResourceClass::Video, video.clone()).await;
    assert_eq!(cache.len().unwrap(), 1);

    // Now served from cache without touching the network
    let before = h.network.count("/videos/breathing.mp4");
    let response = h.engine.handle(ResourceClass::Video, video).await;
    assert_eq!(response.source(), Some("cache"));
    assert_eq!(h.network.count("/videos/breathing.mp4"), before);
  }

  #[tokio::test]
  async fn test_expired_image_is_refetched() {
    let h = harness();
    let images = h.caches.open(CacheNamespace::Images).unwrap();
    let request = get("/avatars/1.png").with_destination(Destination::Image);
    images
      .put_at(
        &request,
        &Response::new(200).with_body("old"),
        Utc::now() - chrono::Duration::days(8),
      )
      .unwrap();
    h.network
      .respond("/avatars/1.png", Response::new(200).with_body("new"));

    let response = h.engine.handle(ResourceClass::Image, request).await;
    assert_eq!(response.body, b"new");
    assert_eq!(response.source(), Some("network"));
  }

  #[tokio::test]
  async fn test_expired_image_offline_serves_old_copy() {
    let h = harness();
    let images = h.caches.open(CacheNamespace::Images).unwrap();
    let request = get("/avatars/1.png").with_destination(Destination::Image);
    images
      .put_at(
        &request,
        &Response::new(200).with_body("old"),
        Utc::now() - chrono::Duration::days(8),
      )
      .unwrap();
    h.network.set_offline(true);

    let response = h.engine.handle(ResourceClass::Image, request.clone()).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"old");
    assert_eq!(response.source(), Some("cache-stale"));
    assert!(images.match_request(&request).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_expired_api_entry_serves_offline() {
    let h = harness();
    let api = h.caches.open(CacheNamespace::Api).unwrap();
    api
      .put_at(
        &get("/api/moods"),
        &Response::json(200, "[1]"),
        Utc::now() - chrono::Duration::hours(25),
      )
      .unwrap();
    h.network.set_offline(true);

    let response = h.engine.handle(ResourceClass::Api, get("/api/moods")).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"[1]");
    assert_eq!(response.source(), Some("cache-stale"));
  }

  #[tokio::test]
  async fn test_expired_community_entry_serves_offline() {
    let h = harness();
    let community = h.caches.open(CacheNamespace::Community).unwrap();
    community
      .put_at(
        &get("/community/posts"),
        &Response::new(200).with_body("week-old posts"),
        Utc::now() - chrono::Duration::days(8),
      )
      .unwrap();
    h.network.set_offline(true);

    let response = h.engine.handle(ResourceClass::Other, get("/community/posts")).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"week-old posts");
    assert_eq!(response.source(), Some("cache-stale"));

    // A failed background refresh leaves the entry in place
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(community.match_request(&get("/community/posts")).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_stale_while_revalidate() {
    let h = harness();
    let community = h.caches.open(CacheNamespace::Community).unwrap();
    community
      .put_at(
        &get("/community/posts"),
        &Response::new(200).with_body("old"),
        Utc::now() - chrono::Duration::minutes(20),
      )
      .unwrap();
    h.network
      .respond("/community/posts", Response::new(200).with_body("new"));

    let response = h.engine.handle(ResourceClass::Other, get("/community/posts")).await;
    assert_eq!(response.body, b"old");
    assert_eq!(response.source(), Some("cache-stale"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let response = h.engine.handle(ResourceClass::Other, get("/community/posts")).await;
    assert_eq!(response.body, b"new");
    assert_eq!(response.source(), Some("cache"));
    assert_eq!(h.network.count("/community/posts"), 1);
  }

  #[tokio::test]
  async fn test_navigation_fallbacks() {
    let h = harness();
    h.network.set_offline(true);
    let journal = get("/journal").with_mode(RequestMode::Navigate);

    // Nothing cached: synthesized page
    let response = h.engine.handle(ResourceClass::Navigation, journal.clone()).await;
    assert!(response.text().contains("988"));
    assert_eq!(response.source(), Some("fallback"));

    h.caches
      .open(CacheNamespace::CriticalFallback)
      .unwrap()
      .put(&get(OFFLINE_PAGE), &Response::html(200, "offline page"))
      .unwrap();
    let response = h.engine.handle(ResourceClass::Navigation, journal).await;
    assert_eq!(response.body, b"offline page");
  }

  #[tokio::test]
  async fn test_passthrough_never_caches() {
    let h = harness();
    h.network.respond("/crisis", Response::html(200, "help"));
    let response = h.engine.passthrough(get("/crisis")).await;
    assert_eq!(response.status, 200);
    assert!(h.caches.open(CacheNamespace::Crisis).unwrap().is_empty().unwrap());
  }
}
