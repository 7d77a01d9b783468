//! Resource classification.
//!
//! Maps an intercepted request to the class that selects its fetch strategy.
//! Classification is pure and only looks at the method, path, mode and
//! destination; it says nothing about whether a response may be cached.

use serde::Serialize;
use std::fmt;

use crate::http::{Destination, Request, RequestMode};
use crate::offline::CRISIS_RESOURCES;

/// Path substrings that mark crisis-intervention resources.
pub const CRISIS_MARKERS: &[&str] = &["crisis", "emergency", "safety", "988", "suicide-prevention"];

/// Path prefixes served by the backend functions.
pub const API_PREFIXES: &[&str] = &["/api/", "/.netlify/functions/"];

const VIDEO_EXTENSIONS: &[&str] = &[".mp4", ".webm", ".mov", ".m3u8"];
const VIDEO_PREFIX: &str = "/videos/";

/// Class of an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
  Crisis,
  Api,
  Video,
  Image,
  Navigation,
  Other,
}

impl ResourceClass {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Crisis => "crisis",
      Self::Api => "api",
      Self::Video => "video",
      Self::Image => "image",
      Self::Navigation => "navigation",
      Self::Other => "other",
    }
  }
}

impl fmt::Display for ResourceClass {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Classify a request. Crisis takes priority over every other class.
pub fn classify(request: &Request) -> ResourceClass {
  let path = request.path().to_ascii_lowercase();

  if is_crisis_path(&path) {
    ResourceClass::Crisis
  } else if is_api_path(&path) {
    ResourceClass::Api
  } else if request.destination == Destination::Video || is_video_path(&path) {
    ResourceClass::Video
  } else if request.destination == Destination::Image {
    ResourceClass::Image
  } else if request.mode == RequestMode::Navigate {
    ResourceClass::Navigation
  } else {
    ResourceClass::Other
  }
}

/// Whether a (lowercased) path belongs to crisis-intervention content.
pub fn is_crisis_path(path: &str) -> bool {
  CRISIS_MARKERS.iter().any(|marker| path.contains(marker)) || CRISIS_RESOURCES.contains(&path)
}

pub fn is_api_path(path: &str) -> bool {
  API_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
}

fn is_video_path(path: &str) -> bool {
  path.starts_with(VIDEO_PREFIX) || VIDEO_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}
