use serde::Serialize;
use tokio::sync::broadcast;

use crate::lifecycle::LifecycleState;

/// Notifications pushed to the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineEvent {
  StateChanged {
    state: LifecycleState,
  },
  /// The active version now serves every client
  ClientsClaimed {
    version: String,
  },
  QueueDrained {
    replayed: usize,
    failed: usize,
    remaining: usize,
  },
}

/// Fan-out of engine events. Sending with no subscribers is not an error.
#[derive(Clone)]
pub struct EventBus {
  tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
  pub fn new(capacity: usize) -> Self {
    let (tx, _) = broadcast::channel(capacity);
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
    self.tx.subscribe()
  }

  pub fn emit(&self, event: EngineEvent) {
    // Err only means nobody is listening
    let _ = self.tx.send(event);
  }
}
