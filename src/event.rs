use serde::Serialize;
use tokio::sync::broadcast;

use crate::notify::Notification;

/// Signals the agent reports to the host application
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum AgentEvent {
  /// Online/offline transition
  ConnectivityChanged { online: bool },
  /// A new cache generation is installed and waiting for cutover
  UpdateAvailable { tag: String },
  /// A cache generation took over serving
  Activated { tag: String },
  /// Number of outbox records still awaiting delivery
  PendingCount { count: usize },
  /// A push message should be rendered
  NotificationShown { notification: Notification },
  /// The user opened a notification; the host routes to `url`
  NotificationClicked { url: String },
  /// The user dismissed a notification
  NotificationDismissed,
}

/// Fan-out channel from the agent to any number of host subscribers
#[derive(Clone)]
pub struct EventBus {
  tx: broadcast::Sender<AgentEvent>,
}

impl EventBus {
  /// Create a new bus buffering up to `capacity` undelivered events per subscriber
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity);
    Self { tx }
  }

  /// Subscribe to future events
  pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
    self.tx.subscribe()
  }

  /// Publish an event; dropped silently when nobody is listening
  pub fn emit(&self, event: AgentEvent) {
    let _ = self.tx.send(event);
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(64)
  }
}
