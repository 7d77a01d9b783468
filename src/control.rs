//! Host control channel.
//!
//! Messages arrive as `{ "type": ..., "payload": {...} }` envelopes and are
//! answered with `{ "success": bool, "data"?: ..., "error"?: ... }`.
//! `SKIP_WAITING` is fire-and-forget and gets no answer; unknown types are
//! logged and ignored.

use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::cache::CacheNamespace;
use crate::engine::CachingEngine;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ControlEnvelope {
  #[serde(rename = "type")]
  pub kind: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub payload: Option<Value>,
}

impl ControlEnvelope {
  pub fn new(kind: impl Into<String>, payload: Option<Value>) -> Self {
    Self {
      kind: kind.into(),
      payload,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlResponse {
  pub success: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub data: Option<Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl ControlResponse {
  pub fn ok(data: Value) -> Self {
    Self {
      success: true,
      data: Some(data),
      error: None,
    }
  }

  pub fn failed(error: impl ToString) -> Self {
    Self {
      success: false,
      data: None,
      error: Some(error.to_string()),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
  SkipWaiting,
  GetVersion,
  ClearCache { namespace: String },
  CacheCrisisResource { url: String },
  GetCacheStatus,
  CheckStorage,
  CacheMaintenance,
}

#[derive(Deserialize)]
struct NamespacePayload {
  namespace: String,
}

#[derive(Deserialize)]
struct UrlPayload {
  url: String,
}

impl ControlMessage {
  /// Decode an envelope. `Ok(None)` for unknown message types.
  pub fn from_envelope(envelope: &ControlEnvelope) -> Result<Option<Self>> {
    let message = match envelope.kind.as_str() {
      "SKIP_WAITING" => Self::SkipWaiting,
      "GET_VERSION" => Self::GetVersion,
      "CLEAR_CACHE" => {
        let payload: NamespacePayload = payload(envelope)?;
        Self::ClearCache {
          namespace: payload.namespace,
        }
      }
      "CACHE_CRISIS_RESOURCE" => {
        let payload: UrlPayload = payload(envelope)?;
        Self::CacheCrisisResource { url: payload.url }
      }
      "GET_CACHE_STATUS" => Self::GetCacheStatus,
      "CHECK_STORAGE" => Self::CheckStorage,
      "CACHE_MAINTENANCE" => Self::CacheMaintenance,
      _ => return Ok(None),
    };
    Ok(Some(message))
  }
}

fn payload<T: DeserializeOwned>(envelope: &ControlEnvelope) -> Result<T> {
  let value = envelope
    .payload
    .clone()
    .ok_or_else(|| eyre!("{} requires a payload", envelope.kind))?;
  serde_json::from_value(value).map_err(|e| eyre!("Invalid {} payload: {}", envelope.kind, e))
}

fn to_data<T: Serialize>(value: &T) -> Result<Value> {
  serde_json::to_value(value).map_err(|e| eyre!("Failed to serialize response: {}", e))
}

/// Handle one control message. `None` means no reply is sent.
pub async fn dispatch(engine: &CachingEngine, envelope: ControlEnvelope) -> Option<ControlResponse> {
  let message = match ControlMessage::from_envelope(&envelope) {
    Ok(Some(message)) => message,
    Ok(None) => {
      warn!(kind = %envelope.kind, "Ignoring unknown control message");
      return None;
    }
    Err(e) => return Some(ControlResponse::failed(e)),
  };
  debug!(?message, "Control message");

  match execute(engine, message).await {
    Ok(Some(data)) => Some(ControlResponse::ok(data)),
    Ok(None) => None,
    Err(e) => {
      warn!(kind = %envelope.kind, error = %e, "Control message failed");
      Some(ControlResponse::failed(e))
    }
  }
}

/// Run a decoded message. `Ok(None)` for messages that get no reply.
async fn execute(engine: &CachingEngine, message: ControlMessage) -> Result<Option<Value>> {
  let data = match message {
    ControlMessage::SkipWaiting => {
      // Fire-and-forget: failures are only logged
      if let Err(e) = engine.skip_waiting().await {
        warn!(error = %e, "Skip waiting failed");
      }
      return Ok(None);
    }
    ControlMessage::GetVersion => json!({ "version": engine.version().as_str() }),
    ControlMessage::ClearCache { namespace } => {
      let ns: CacheNamespace = namespace.parse()?;
      let removed = engine.clear_cache(ns)?;
      json!({ "namespace": ns, "removed": removed })
    }
    ControlMessage::CacheCrisisResource { url } => {
      to_data(&engine.cache_crisis_resource(&url).await?)?
    }
    ControlMessage::GetCacheStatus => json!({
      "version": engine.version().as_str(),
      "caches": to_data(&engine.cache_status()?)?,
    }),
    ControlMessage::CheckStorage => to_data(&engine.storage_report()?)?,
    ControlMessage::CacheMaintenance => to_data(&engine.maintenance().await?)?,
  };
  Ok(Some(data))
}

/// Handle a raw JSON envelope and serialize the reply.
pub async fn dispatch_json(engine: &CachingEngine, raw: &str) -> Option<String> {
  let response = match serde_json::from_str::<ControlEnvelope>(raw) {
    Ok(envelope) => dispatch(engine, envelope).await?,
    Err(e) => ControlResponse::failed(format!("Malformed control message: {}", e)),
  };

  match serde_json::to_string(&response) {
    Ok(json) => Some(json),
    Err(e) => {
      warn!(error = %e, "Failed to serialize control response");
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::testing::{engine, serve_offline_resources};
  use crate::lifecycle::LifecycleState;

  fn envelope(kind: &str, payload: Value) -> ControlEnvelope {
    ControlEnvelope::new(kind, Some(payload))
  }

  #[test]
  fn test_parse_messages() {
    let parsed = ControlMessage::from_envelope(&envelope(
      "CLEAR_CACHE",
      json!({ "namespace": "images" }),
    ))
    .unwrap();
    assert_eq!(
      parsed,
      Some(ControlMessage::ClearCache {
        namespace: "images".into()
      })
    );

    let unknown = ControlEnvelope::new("PING", None);
    assert_eq!(ControlMessage::from_envelope(&unknown).unwrap(), None);

    let missing = ControlEnvelope::new("CACHE_CRISIS_RESOURCE", None);
    assert!(ControlMessage::from_envelope(&missing).is_err());
  }

  #[tokio::test]
  async fn test_get_version() {
    let t = engine();
    let response = dispatch(&t.engine, ControlEnvelope::new("GET_VERSION", None))
      .await
      .unwrap();
    assert!(response.success);
    assert_eq!(response.data, Some(json!({ "version": "v1" })));
  }

  #[tokio::test]
  async fn test_clear_crisis_is_rejected() {
    let t = engine();
    serve_offline_resources(&t.network);
    t.engine.start().await.unwrap();
    let before = t.engine.cache_status().unwrap()["crisis"].entries;

    let response = dispatch(
      &t.engine,
      envelope("CLEAR_CACHE", json!({ "namespace": "crisis" })),
    )
    .await
    .unwrap();

    assert!(!response.success);
    assert!(response.error.is_some());
    assert_eq!(t.engine.cache_status().unwrap()["crisis"].entries, before);
  }

  #[tokio::test]
  async fn test_clear_other_namespace() {
    let t = engine();
    serve_offline_resources(&t.network);
    t.engine.start().await.unwrap();

    let response = dispatch(
      &t.engine,
      envelope("CLEAR_CACHE", json!({ "namespace": "critical-fallback" })),
    )
    .await
    .unwrap();
    assert!(response.success);
    assert_eq!(t.engine.cache_status().unwrap()["critical-fallback"].entries, 0);

    let response = dispatch(
      &t.engine,
      envelope("CLEAR_CACHE", json!({ "namespace": "nope" })),
    )
    .await
    .unwrap();
    assert!(!response.success);
  }

  #[tokio::test]
  async fn test_skip_waiting_has_no_reply() {
    let t = engine();
    serve_offline_resources(&t.network);
    t.engine.install().await.unwrap();

    let response = dispatch(&t.engine, ControlEnvelope::new("SKIP_WAITING", None)).await;
    assert!(response.is_none());
    assert_eq!(t.engine.state(), LifecycleState::Active);
  }

  #[tokio::test]
  async fn test_unknown_type_is_ignored() {
    let t = engine();
    assert!(dispatch_json(&t.engine, r#"{"type":"PING"}"#).await.is_none());
  }

  #[tokio::test]
  async fn test_malformed_json_gets_error_reply() {
    let t = engine();
    let reply = dispatch_json(&t.engine, "{not json").await.unwrap();
    let value: Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(value["success"], json!(false));
    assert!(value.get("data").is_none());
  }

  #[tokio::test]
  async fn test_cache_crisis_resource_reply() {
    let t = engine();
    t.network.respond(
      "/crisis/hotlines.json",
      crate::http::Response::json(200, "[]"),
    );

    let reply = dispatch_json(
      &t.engine,
      r#"{"type":"CACHE_CRISIS_RESOURCE","payload":{"url":"/crisis/hotlines.json"}}"#,
    )
    .await
    .unwrap();
    let value: Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(value["success"], json!(true));
    assert_eq!(value["data"]["url"], json!("https://app.test/crisis/hotlines.json"));
    assert_eq!(value["data"]["unchanged"], json!(false));
  }

  #[tokio::test]
  async fn test_status_storage_and_maintenance() {
    let t = engine();
    serve_offline_resources(&t.network);
    t.engine.start().await.unwrap();

    let status = dispatch(&t.engine, ControlEnvelope::new("GET_CACHE_STATUS", None))
      .await
      .unwrap();
    let data = status.data.unwrap();
    assert_eq!(data["caches"]["crisis"]["entries"], json!(7));

    let storage = dispatch(&t.engine, ControlEnvelope::new("CHECK_STORAGE", None))
      .await
      .unwrap();
    let data = storage.data.unwrap();
    assert!(data.get("ratio").is_some());
    assert!(data["namespaces"].get("video").is_some());

    let maintenance = dispatch(&t.engine, ControlEnvelope::new("CACHE_MAINTENANCE", None))
      .await
      .unwrap();
    assert!(maintenance.success);
    assert_eq!(maintenance.data.unwrap()["drained"]["remaining"], json!(0));
  }
}
