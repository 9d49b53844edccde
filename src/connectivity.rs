//! Process-wide online/offline state.

use std::time::Duration;
use tokio::sync::watch;
use tracing::info;
use url::Url;

use crate::event::{AgentEvent, EventBus};
use crate::network::{Network, Request};

/// Connectivity flag shared by every component of one agent instance.
///
/// Initialized once from the platform's state at start and flipped on
/// transition events; readers subscribe for changes.
#[derive(Clone)]
pub struct Connectivity {
  tx: watch::Sender<bool>,
  events: EventBus,
}

impl Connectivity {
  pub fn new(initially_online: bool, events: EventBus) -> Self {
    let (tx, _rx) = watch::channel(initially_online);
    Self { tx, events }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Record a transition. Returns true if the state actually changed.
  pub fn set_online(&self, online: bool) -> bool {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });

    if changed {
      info!(online, "connectivity changed");
      self.events.emit(AgentEvent::ConnectivityChanged { online });
    }

    changed
  }

  /// Watch for transitions
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

/// Derive connectivity by probing the origin with a bounded wait.
///
/// Any answer from the server, whatever its status, counts as online.
pub async fn probe<N: Network>(network: &N, target: &Url, timeout: Duration) -> bool {
  let request = Request::new("HEAD", target.clone());
  matches!(
    tokio::time::timeout(timeout, network.fetch(&request)).await,
    Ok(Ok(_))
  )
}
