//! Push message rendering and notification click handling.
//!
//! Showing a notification and handling a click on it share nothing but the
//! data embedded in the [`Notification`] itself, so a click still resolves
//! after the agent restarts.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::event::AgentEvent;

pub const DEFAULT_TITLE: &str = "New update";
pub const DEFAULT_BODY: &str = "Something changed while you were away.";
pub const DEFAULT_ICON: &str = "/icons/icon-192.png";
pub const DEFAULT_URL: &str = "/";

/// A notification ready for the host to display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  /// Target view opened on click
  pub url: String,
}

impl Default for Notification {
  fn default() -> Self {
    Self {
      title: DEFAULT_TITLE.to_string(),
      body: DEFAULT_BODY.to_string(),
      icon: DEFAULT_ICON.to_string(),
      url: DEFAULT_URL.to_string(),
    }
  }
}

/// What the user did with a displayed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationAction {
  Open,
  Dismiss,
}

/// Build a notification from a raw push payload.
///
/// Never fails: an unparseable payload yields the defaults, and each missing or
/// mistyped field falls back to its own default.
pub fn from_push(payload: &[u8]) -> Notification {
  let value: Value = match serde_json::from_slice(payload) {
    Ok(v) => v,
    Err(e) => {
      warn!(error = %e, "malformed push payload, using defaults");
      return Notification::default();
    }
  };

  let Some(fields) = value.as_object() else {
    warn!("push payload is not an object, using defaults");
    return Notification::default();
  };

  let field = |name: &str, default: &str| -> String {
    match fields.get(name) {
      Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
      Some(Value::Null) | None => default.to_string(),
      Some(other) => {
        warn!(field = name, value = %other, "invalid push field, using default");
        default.to_string()
      }
    }
  };

  Notification {
    title: field("title", DEFAULT_TITLE),
    body: field("body", DEFAULT_BODY),
    icon: field("icon", DEFAULT_ICON),
    url: field("url", DEFAULT_URL),
  }
}

/// Resolve a click into the event the host should act on.
pub fn handle_click(notification: &Notification, action: NotificationAction) -> AgentEvent {
  match action {
    NotificationAction::Open => AgentEvent::NotificationClicked {
      url: notification.url.clone(),
    },
    NotificationAction::Dismiss => AgentEvent::NotificationDismissed,
  }
}
