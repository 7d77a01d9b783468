//! Offline-resilience engine for a crisis-support web app.
//!
//! Sits between the app and the network: classifies every request, answers
//! it from versioned caches or the network according to its class, keeps
//! crisis resources available offline, and queues failed writes for replay.

pub mod cache;
pub mod classify;
pub mod config;
pub mod control;
pub mod db;
pub mod engine;
pub mod event;
pub mod http;
pub mod lifecycle;
pub mod logging;
pub mod network;
pub mod offline;
pub mod quota;
pub mod strategy;
pub mod sync_queue;

pub use config::Config;
pub use engine::CachingEngine;
pub use event::EngineEvent;
pub use http::{Request, Response};
pub use network::{HttpNetwork, Network};
