//! Stored request/response snapshots.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::http::{Response, ResponseSource};

/// A cached response for one (method, normalized URL) key.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub method: String,
  pub url: String,
  pub response: Response,
  /// When the entry was captured
  pub cached_at: DateTime<Utc>,
}

impl CachedEntry {
  pub fn age(&self, now: DateTime<Utc>) -> Duration {
    now - self.cached_at
  }

  /// Hex sha256 of the stored body.
  pub fn digest(&self) -> String {
    body_digest(&self.response.body)
  }

  /// The stored response tagged for delivery to the host.
  pub fn into_response(self, source: ResponseSource) -> Response {
    self.response.with_source(source)
  }
}

/// Hex sha256 of a response body.
pub fn body_digest(body: &[u8]) -> String {
  hex::encode(Sha256::digest(body))
}

/// Size summary of one namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  pub entries: usize,
  pub bytes: u64,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_digest_is_stable_hex() {
    let entry = CachedEntry {
      method: "GET".to_string(),
      url: "https://app.test/crisis".to_string(),
      response: Response::new(200).with_body("help"),
      cached_at: Utc::now(),
    };
    assert_eq!(entry.digest().len(), 64);
    assert_eq!(entry.digest(), body_digest(b"help"));
  }

  #[test]
  fn test_into_response_tags_source() {
    let entry = CachedEntry {
      method: "GET".to_string(),
      url: "https://app.test/crisis".to_string(),
      response: Response::new(200),
      cached_at: Utc::now() - Duration::minutes(3),
    };
    assert!(entry.age(Utc::now()) >= Duration::minutes(3));
    assert_eq!(
      entry.into_response(ResponseSource::Cache).source(),
      Some("cache")
    );
  }
}
