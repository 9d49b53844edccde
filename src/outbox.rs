//! Durable FIFO queue of client writes awaiting delivery.
//!
//! Records are ordered by a creation-monotonic id (microsecond timestamp,
//! bumped past the previous id on collision). A record leaves the queue only
//! through [`Outbox::remove`], which the dispatcher calls after the remote has
//! acknowledged it.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::db::Database;
use crate::error::{AgentError, AgentResult};

pub type OutboxId = i64;

/// A pending mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxRecord {
  pub id: OutboxId,
  pub payload: Value,
  pub created_at: DateTime<Utc>,
  /// Failed delivery attempts so far
  pub attempts: u32,
  pub last_error: Option<String>,
}

#[derive(Clone)]
pub struct Outbox {
  db: Database,
}

impl Outbox {
  pub fn new(db: Database) -> Self {
    Self { db }
  }

  /// Append a payload. The record is committed to disk before this returns.
  pub fn enqueue(&self, payload: &Value) -> AgentResult<OutboxId> {
    let data = serde_json::to_string(payload)?;
    let conn = self.db.conn()?;

    let last: Option<OutboxId> = conn.query_row("SELECT MAX(id) FROM outbox", [], |row| row.get(0))?;
    let now = Utc::now().timestamp_micros();
    let id = match last {
      Some(last) if last >= now => last + 1,
      _ => now,
    };

    conn.execute(
      "INSERT INTO outbox (id, payload) VALUES (?, ?)",
      params![id, data],
    )?;

    debug!(id, "enqueued outbox record");
    Ok(id)
  }

  /// The record that must be delivered next.
  pub fn peek_oldest(&self) -> AgentResult<Option<OutboxRecord>> {
    let conn = self.db.conn()?;

    let row = conn
      .query_row(
        "SELECT id, payload, created_at, attempts, last_error FROM outbox
         ORDER BY id LIMIT 1",
        [],
        read_row,
      )
      .optional()?;

    row.map(into_record).transpose()
  }

  /// Remove a delivered record. Removing an unknown id is a no-op.
  pub fn remove(&self, id: OutboxId) -> AgentResult<()> {
    let conn = self.db.conn()?;
    conn.execute("DELETE FROM outbox WHERE id = ?", params![id])?;
    Ok(())
  }

  /// Note a failed delivery attempt on a record that stays queued.
  pub fn record_failure(&self, id: OutboxId, error: &str) -> AgentResult<()> {
    let conn = self.db.conn()?;
    conn.execute(
      "UPDATE outbox SET attempts = attempts + 1, last_error = ? WHERE id = ?",
      params![error, id],
    )?;
    Ok(())
  }

  /// All pending records in delivery order.
  pub fn list(&self) -> AgentResult<Vec<OutboxRecord>> {
    let conn = self.db.conn()?;

    let mut stmt = conn.prepare(
      "SELECT id, payload, created_at, attempts, last_error FROM outbox ORDER BY id",
    )?;
    let rows = stmt
      .query_map([], read_row)?
      .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter().map(into_record).collect()
  }

  pub fn len(&self) -> AgentResult<usize> {
    let conn = self.db.conn()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?;
    Ok(count as usize)
  }

  pub fn is_empty(&self) -> AgentResult<bool> {
    Ok(self.len()? == 0)
  }
}

type RawRecord = (OutboxId, String, String, u32, Option<String>);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
  ))
}

fn into_record((id, payload, created_at, attempts, last_error): RawRecord) -> AgentResult<OutboxRecord> {
  Ok(OutboxRecord {
    id,
    payload: serde_json::from_str(&payload)?,
    created_at: parse_datetime(&created_at)?,
    attempts,
    last_error,
  })
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> AgentResult<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| AgentError::Corrupt(format!("datetime '{}': {}", s, e)))
}
