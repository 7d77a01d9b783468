//! Named offline resources and synthesized fallback responses.

use serde_json::json;

use crate::http::{Response, ResponseSource};

/// Resources pre-seeded into the crisis namespace at install.
pub const CRISIS_RESOURCES: [&str; 7] = [
  "/crisis",
  "/emergency",
  "/safety-plan",
  "/crisis-resources.json",
  "/offline-coping-strategies.json",
  "/emergency-contacts.json",
  OFFLINE_CRISIS_PAGE,
];

/// Resources pre-seeded into the critical-fallback namespace at install.
pub const OFFLINE_PAGES: [&str; 2] = [OFFLINE_PAGE, OFFLINE_CRISIS_PAGE];

pub const OFFLINE_PAGE: &str = "/offline.html";
pub const OFFLINE_CRISIS_PAGE: &str = "/offline-crisis.html";

/// Resource that receives the synthesized hotline JSON when activation finds
/// the crisis namespace empty and the network unreachable.
pub const CRISIS_RESOURCES_JSON: &str = "/crisis-resources.json";

/// Hotline payload served when no crisis data can be obtained.
pub const CRISIS_FALLBACK_JSON: &str = r#"{"emergency":"988","text":"988","international":"+1-741-741-741","message":"You are not alone. Help is available."}"#;

const MINIMAL_OFFLINE_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><title>Offline</title></head>
<body>
<h1>You are offline</h1>
<p>This page is not available without a connection.</p>
<p>If you are in crisis, call or text <strong>988</strong>, or text HOME to <strong>741741</strong>.</p>
</body>
</html>
"#;

/// Synthesized hotline JSON.
pub fn crisis_fallback() -> Response {
  Response::json(200, CRISIS_FALLBACK_JSON).with_source(ResponseSource::Fallback)
}

/// Last-resort HTML for navigations with no cached offline page.
pub fn minimal_offline_page() -> Response {
  Response::html(503, MINIMAL_OFFLINE_HTML).with_source(ResponseSource::Fallback)
}

/// Generic "offline" response for non-crisis resources.
pub fn service_unavailable(message: &str) -> Response {
  let body = json!({ "error": "offline", "message": message });
  Response::json(503, body.to_string()).with_source(ResponseSource::Fallback)
}

/// Acknowledgement for a mutating request stored in the sync queue.
pub fn queued(id: i64) -> Response {
  let body = json!({
    "queued": true,
    "id": id,
    "message": "Saved offline. It will be sent when you are back online.",
  });
  Response::json(202, body.to_string()).with_source(ResponseSource::Queued)
}

/// A mutating request that could neither be sent nor queued.
pub fn not_queued() -> Response {
  let body = json!({
    "queued": false,
    "error": "offline",
    "message": "Could not send or save this request. Please try again.",
  });
  Response::json(503, body.to_string()).with_source(ResponseSource::Fallback)
}
