//! Outbox drain loop.
//!
//! Delivery is strictly head-of-line: the oldest record must be acknowledged
//! before the next one is attempted, and the first failure ends the pass.
//! Only one pass runs at a time; triggers arriving during a pass collapse into
//! a single follow-up pass.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::remote::Remote;
use crate::connectivity::Connectivity;
use crate::error::AgentResult;
use crate::event::{AgentEvent, EventBus};
use crate::outbox::{Outbox, OutboxId};

/// What woke the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainTrigger {
  /// Explicit request from the host (background sync)
  BackgroundSync,
  /// Connectivity came back
  Reconnected,
  /// Timer
  Periodic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
  /// Every record was delivered
  Emptied,
  /// A delivery failed; the record stays at the head of the queue
  Halted,
  /// Offline before or during the pass
  Offline,
  /// Another pass was already running
  AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
  pub trigger: DrainTrigger,
  pub outcome: DrainOutcome,
  pub delivered: usize,
  /// Record that failed and blocked the queue
  pub halted_at: Option<OutboxId>,
  pub remaining: usize,
}

pub struct SyncDispatcher<R: Remote> {
  outbox: Outbox,
  remote: Arc<R>,
  connectivity: Connectivity,
  events: EventBus,
  wake: Notify,
  draining: tokio::sync::Mutex<()>,
}

impl<R: Remote> SyncDispatcher<R> {
  pub fn new(outbox: Outbox, remote: Arc<R>, connectivity: Connectivity, events: EventBus) -> Self {
    Self {
      outbox,
      remote,
      connectivity,
      events,
      wake: Notify::new(),
      draining: tokio::sync::Mutex::new(()),
    }
  }

  /// Ask the running loop for a pass. Repeated calls before it wakes coalesce.
  pub fn trigger(&self) {
    self.wake.notify_one();
  }

  /// Run one drain pass now.
  pub async fn drain(&self, trigger: DrainTrigger) -> AgentResult<DrainReport> {
    let Ok(_pass) = self.draining.try_lock() else {
      debug!(?trigger, "drain already in progress");
      return Ok(DrainReport {
        trigger,
        outcome: DrainOutcome::AlreadyRunning,
        delivered: 0,
        halted_at: None,
        remaining: self.outbox.len()?,
      });
    };

    let mut delivered = 0;
    let mut halted_at = None;

    let outcome = loop {
      if !self.connectivity.is_online() {
        break DrainOutcome::Offline;
      }

      let Some(record) = self.outbox.peek_oldest()? else {
        break DrainOutcome::Emptied;
      };

      match self.remote.deliver(&record).await {
        Ok(()) => {
          // A crash before this line means the record is delivered again next time
          self.outbox.remove(record.id)?;
          delivered += 1;
          debug!(id = record.id, "delivered outbox record");
        }
        Err(e) => {
          if e.is_transient() {
            warn!(id = record.id, attempts = record.attempts + 1, error = %e, "delivery failed, halting drain");
          } else {
            // Stays at the head until the payload or the endpoint is fixed
            error!(id = record.id, attempts = record.attempts + 1, error = %e, "record cannot be delivered, halting drain");
          }
          if let Err(bookkeeping) = self.outbox.record_failure(record.id, &e.to_string()) {
            warn!(id = record.id, error = %bookkeeping, "failed to record delivery failure");
          }
          halted_at = Some(record.id);
          break DrainOutcome::Halted;
        }
      }
    };

    let remaining = self.outbox.len()?;
    info!(?trigger, ?outcome, delivered, remaining, "drain pass finished");
    self.events.emit(AgentEvent::PendingCount { count: remaining });

    Ok(DrainReport {
      trigger,
      outcome,
      delivered,
      halted_at,
      remaining,
    })
  }

  /// Drain on explicit triggers, on reconnection and every `interval`, until shutdown.
  pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut online = self.connectivity.subscribe();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      let trigger = tokio::select! {
        _ = self.wake.notified() => DrainTrigger::BackgroundSync,
        _ = ticker.tick() => DrainTrigger::Periodic,
        changed = online.changed() => {
          if changed.is_err() {
            break;
          }
          if !*online.borrow_and_update() {
            continue;
          }
          DrainTrigger::Reconnected
        }
        _ = shutdown.changed() => break,
      };

      if let Err(e) = self.drain(trigger).await {
        warn!(?trigger, error = %e, "drain pass aborted");
      }
    }

    debug!("dispatcher stopped");
  }
}
