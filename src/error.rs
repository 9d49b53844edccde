//! Error types for the agent.

use std::time::Duration;

use thiserror::Error;

/// Result type for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors that can occur inside the agent.
#[derive(Error, Debug)]
pub enum AgentError {
  /// The network could not be reached (DNS, refused connection, offline).
  #[error("network error: {0}")]
  Network(String),

  /// The network did not answer within the bounded wait.
  #[error("request timed out after {0:?}")]
  Timeout(Duration),

  /// A response could not be written to the cache.
  #[error("cache write failed: {0}")]
  CacheWrite(String),

  /// Seeding a new cache generation failed; the prior generation stays active.
  #[error("install of generation {tag} failed: {reason}")]
  Install { tag: String, reason: String },

  /// The remote endpoint did not acknowledge an outbox record.
  #[error("delivery of record {id} failed: {reason}")]
  Delivery { id: i64, reason: String },

  /// Underlying SQLite failure.
  #[error("storage error: {0}")]
  Storage(#[from] rusqlite::Error),

  /// Persisted state could not be decoded.
  #[error("corrupt stored state: {0}")]
  Corrupt(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("invalid url: {0}")]
  InvalidUrl(#[from] url::ParseError),

  #[error("lock poisoned")]
  LockPoisoned,
}

impl AgentError {
  /// Returns true if the failure should be retried via cache fallback or a later trigger.
  pub fn is_transient(&self) -> bool {
    matches!(
      self,
      AgentError::Network(_) | AgentError::Timeout(_) | AgentError::Delivery { .. }
    )
  }
}

impl<T> From<std::sync::PoisonError<T>> for AgentError {
  fn from(_: std::sync::PoisonError<T>) -> Self {
    AgentError::LockPoisoned
  }
}
