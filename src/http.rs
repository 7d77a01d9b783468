//! Request and response snapshots exchanged with the host and the network.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use url::Url;

pub use reqwest::Method;

/// Header attached to every engine response naming where it came from.
pub const SOURCE_HEADER: &str = "x-lifeline-source";

/// Fetch mode of an intercepted request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
  /// Top-level page navigation
  Navigate,
  #[default]
  Cors,
  NoCors,
  SameOrigin,
}

/// What the host intends to do with the response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
  Document,
  Image,
  Video,
  Audio,
  Script,
  Style,
  #[default]
  Empty,
}

/// An intercepted outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: BTreeMap<String, String>,
  pub body: Option<String>,
  pub mode: RequestMode,
  pub destination: Destination,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: BTreeMap::new(),
      body: None,
      mode: RequestMode::default(),
      destination: Destination::default(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .headers
      .insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn with_body(mut self, body: impl Into<String>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn with_mode(mut self, mode: RequestMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::GET
  }

  pub fn path(&self) -> &str {
    self.url.path()
  }

  /// Normalized URL used as the cache key (fragment dropped).
  pub fn cache_url(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    url.into()
  }

  /// Whether the caller expects a JSON body back.
  pub fn wants_json(&self) -> bool {
    self.path().ends_with(".json")
      || self
        .headers
        .get("accept")
        .is_some_and(|accept| accept.contains("application/json"))
  }
}

/// Where a response handed back to the host came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseSource {
  /// Fresh data from network
  Network,
  /// Data from cache, within its freshness window
  Cache,
  /// Data from cache served because the network was unavailable or the entry is being refreshed
  CacheStale,
  /// Synthesized or pre-seeded offline page
  Fallback,
  /// Mutating request stored for later replay
  Queued,
}

impl ResponseSource {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::CacheStale => "cache-stale",
      Self::Fallback => "fallback",
      Self::Queued => "queued",
    }
  }
}

/// A response snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: Vec::new(),
    }
  }

  /// A response with a JSON body taken verbatim.
  pub fn json(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self::new(status)
      .with_header("content-type", "application/json")
      .with_body(body)
  }

  pub fn html(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self::new(status)
      .with_header("content-type", "text/html; charset=utf-8")
      .with_body(body)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .headers
      .insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = body.into();
    self
  }

  /// Tag the response with its origin.
  pub fn with_source(self, source: ResponseSource) -> Self {
    self.with_header(SOURCE_HEADER, source.as_str())
  }

  pub fn source(&self) -> Option<&str> {
    self.headers.get(SOURCE_HEADER).map(String::as_str)
  }

  /// Drop engine-internal headers before persisting.
  pub fn without_source(mut self) -> Self {
    self.headers.remove(SOURCE_HEADER);
    self
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Only full (200) or opaque (0) responses may be cached.
  pub fn is_cacheable(&self) -> bool {
    self.status == 0 || self.status == 200
  }

  pub fn text(&self) -> Cow<'_, str> {
    String::from_utf8_lossy(&self.body)
  }
}

/// Parse an HTTP method name.
pub fn parse_method(name: &str) -> Result<Method> {
  Method::from_bytes(name.to_ascii_uppercase().as_bytes())
    .map_err(|e| eyre!("Invalid HTTP method '{}': {}", name, e))
}
