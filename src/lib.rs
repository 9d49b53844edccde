//! Offline proxy and durable sync agent.
//!
//! The agent sits between a client application and the network:
//! - intercepts requests to its origin, network first with the cache as fallback
//! - keeps one versioned cache generation per deployment, cut over explicitly
//! - queues client writes durably and delivers them in order once online
//! - renders push messages into notifications the host can display

pub mod agent;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod event;
pub mod intercept;
pub mod lifecycle;
pub mod network;
pub mod notify;
pub mod outbox;
pub mod sync;

#[cfg(test)]
mod testing;

pub use agent::{Agent, HttpAgent, Status};
pub use config::Config;
pub use error::{AgentError, AgentResult};
pub use event::AgentEvent;
