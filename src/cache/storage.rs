//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use url::Url;

use super::fingerprint::Fingerprint;
use super::types::StoredResponse;
use crate::db::Database;
use crate::error::{AgentError, AgentResult};
use crate::lifecycle::GenerationState;
use crate::network::Request;

/// A cache generation as recorded on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRecord {
  pub tag: String,
  pub state: GenerationState,
  pub entries: usize,
}

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync + 'static {
  /// Get the entry stored under a fingerprint in a generation.
  fn get(&self, tag: &str, fingerprint: &Fingerprint) -> AgentResult<Option<StoredResponse>>;

  /// Store (or wholesale replace) a single entry.
  ///
  /// Fails if the generation is unknown or superseded.
  fn put(&self, tag: &str, entry: &StoredResponse) -> AgentResult<()>;

  /// Store a batch of entries in one transaction: all land or none do.
  fn put_many(&self, tag: &str, entries: &[StoredResponse]) -> AgentResult<()>;

  /// Delete every generation and entry not belonging to `tag`.
  /// Returns the number of entries removed.
  fn delete_all_except(&self, tag: &str) -> AgentResult<usize>;

  /// Fingerprints stored in a generation, oldest first.
  fn list_fingerprints(&self, tag: &str) -> AgentResult<Vec<Fingerprint>>;

  /// The requests behind a generation's entries, as the client issued them, oldest first.
  fn list_requests(&self, tag: &str) -> AgentResult<Vec<Request>>;

  /// Create or update a generation's lifecycle state.
  fn set_generation_state(&self, tag: &str, state: GenerationState) -> AgentResult<()>;

  /// Make `tag` the only active generation; any previous active one becomes superseded.
  fn activate_generation(&self, tag: &str) -> AgentResult<()>;

  /// Drop a generation and all of its entries.
  fn delete_generation(&self, tag: &str) -> AgentResult<()>;

  /// The tag of the active generation, if any.
  fn active_generation(&self) -> AgentResult<Option<String>>;

  /// All known generations.
  fn generations(&self) -> AgentResult<Vec<GenerationRecord>>;
}

/// SQLite-based cache storage implementation.
#[derive(Clone)]
pub struct SqliteStorage {
  db: Database,
}

impl SqliteStorage {
  pub fn new(db: Database) -> Self {
    Self { db }
  }
}

const WRITABLE_GENERATION: &str =
  "SELECT 1 FROM generations WHERE tag = ?1 AND state IN ('installing', 'waiting', 'active')";

impl CacheStorage for SqliteStorage {
  fn get(&self, tag: &str, fingerprint: &Fingerprint) -> AgentResult<Option<StoredResponse>> {
    let conn = self.db.conn()?;

    let row: Option<(String, String, String, u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT method, url, request_url, status, headers, body, stored_at FROM cache_entries
         WHERE tag = ? AND fingerprint = ?",
        params![tag, fingerprint.cache_key()],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
          ))
        },
      )
      .optional()?;

    match row {
      Some((method, url, request_url, status, headers, body, stored_at)) => Ok(Some(StoredResponse {
        fingerprint: Fingerprint::from_parts(method, url),
        request_url: parse_url(&request_url)?,
        status,
        headers: serde_json::from_str(&headers)?,
        body,
        stored_at: parse_datetime(&stored_at)?,
      })),
      None => Ok(None),
    }
  }

  fn put(&self, tag: &str, entry: &StoredResponse) -> AgentResult<()> {
    let conn = self.db.conn()?;
    let written = insert_entry(&conn, tag, entry)?;

    if written == 0 {
      return Err(AgentError::CacheWrite(format!(
        "generation {} is not accepting writes",
        tag
      )));
    }

    Ok(())
  }

  fn put_many(&self, tag: &str, entries: &[StoredResponse]) -> AgentResult<()> {
    let mut conn = self.db.conn()?;
    let tx = conn.transaction()?;

    for entry in entries {
      if insert_entry(&tx, tag, entry)? == 0 {
        // Dropping the transaction rolls back everything written so far
        return Err(AgentError::CacheWrite(format!(
          "generation {} is not accepting writes",
          tag
        )));
      }
    }

    tx.commit()?;
    Ok(())
  }

  fn delete_all_except(&self, tag: &str) -> AgentResult<usize> {
    let mut conn = self.db.conn()?;
    let tx = conn.transaction()?;

    let removed = tx.execute("DELETE FROM cache_entries WHERE tag != ?", params![tag])?;
    tx.execute("DELETE FROM generations WHERE tag != ?", params![tag])?;

    tx.commit()?;
    Ok(removed)
  }

  fn list_fingerprints(&self, tag: &str) -> AgentResult<Vec<Fingerprint>> {
    let conn = self.db.conn()?;

    let mut stmt = conn.prepare(
      "SELECT method, url FROM cache_entries WHERE tag = ?
       ORDER BY stored_at, rowid",
    )?;

    let fingerprints = stmt
      .query_map(params![tag], |row| {
        Ok(Fingerprint::from_parts(row.get(0)?, row.get(1)?))
      })?
      .collect::<Result<Vec<_>, _>>()?;

    Ok(fingerprints)
  }

  fn list_requests(&self, tag: &str) -> AgentResult<Vec<Request>> {
    let conn = self.db.conn()?;

    let mut stmt = conn.prepare(
      "SELECT method, request_url FROM cache_entries WHERE tag = ?
       ORDER BY stored_at, rowid",
    )?;

    let rows = stmt
      .query_map(params![tag], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
      })?
      .collect::<Result<Vec<_>, _>>()?;

    rows
      .into_iter()
      .map(|(method, url)| Ok(Request::new(&method, parse_url(&url)?)))
      .collect()
  }

  fn set_generation_state(&self, tag: &str, state: GenerationState) -> AgentResult<()> {
    let conn = self.db.conn()?;

    conn.execute(
      "INSERT INTO generations (tag, state) VALUES (?1, ?2)
       ON CONFLICT(tag) DO UPDATE SET state = excluded.state",
      params![tag, state.as_str()],
    )?;

    Ok(())
  }

  fn activate_generation(&self, tag: &str) -> AgentResult<()> {
    let mut conn = self.db.conn()?;
    let tx = conn.transaction()?;

    tx.execute(
      "UPDATE generations SET state = ?1 WHERE state = ?2 AND tag != ?3",
      params![
        GenerationState::Superseded.as_str(),
        GenerationState::Active.as_str(),
        tag
      ],
    )?;
    tx.execute(
      "INSERT INTO generations (tag, state, activated_at) VALUES (?1, ?2, datetime('now'))
       ON CONFLICT(tag) DO UPDATE SET state = excluded.state, activated_at = excluded.activated_at",
      params![tag, GenerationState::Active.as_str()],
    )?;

    tx.commit()?;
    Ok(())
  }

  fn delete_generation(&self, tag: &str) -> AgentResult<()> {
    let mut conn = self.db.conn()?;
    let tx = conn.transaction()?;

    tx.execute("DELETE FROM cache_entries WHERE tag = ?", params![tag])?;
    tx.execute("DELETE FROM generations WHERE tag = ?", params![tag])?;

    tx.commit()?;
    Ok(())
  }

  fn active_generation(&self) -> AgentResult<Option<String>> {
    let conn = self.db.conn()?;

    let tag = conn
      .query_row(
        "SELECT tag FROM generations WHERE state = ? ORDER BY activated_at DESC LIMIT 1",
        params![GenerationState::Active.as_str()],
        |row| row.get(0),
      )
      .optional()?;

    Ok(tag)
  }

  fn generations(&self) -> AgentResult<Vec<GenerationRecord>> {
    let conn = self.db.conn()?;

    let mut stmt = conn.prepare(
      "SELECT g.tag, g.state, COUNT(e.fingerprint) FROM generations g
       LEFT JOIN cache_entries e ON e.tag = g.tag
       GROUP BY g.tag, g.state
       ORDER BY g.created_at, g.rowid",
    )?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, i64>(2)?,
        ))
      })?
      .collect::<Result<Vec<_>, _>>()?;

    Ok(
      rows
        .into_iter()
        .filter_map(|(tag, state, entries)| {
          GenerationState::parse(&state).map(|state| GenerationRecord {
            tag,
            state,
            entries: entries as usize,
          })
        })
        .collect(),
    )
  }
}

/// Insert or replace one entry, guarded on the generation being writable.
/// Returns the number of rows written (0 when the generation rejects writes).
fn insert_entry(conn: &rusqlite::Connection, tag: &str, entry: &StoredResponse) -> AgentResult<usize> {
  let headers = serde_json::to_string(&entry.headers)?;

  let written = conn.execute(
    &format!(
      "INSERT OR REPLACE INTO cache_entries
         (tag, fingerprint, method, url, request_url, status, headers, body, stored_at)
       SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9 WHERE EXISTS ({})",
      WRITABLE_GENERATION
    ),
    params![
      tag,
      entry.fingerprint.cache_key(),
      entry.fingerprint.method(),
      entry.fingerprint.url(),
      entry.request_url.as_str(),
      entry.status,
      headers,
      entry.body,
      entry.stored_at.to_rfc3339(),
    ],
  )?;

  Ok(written)
}

fn parse_url(s: &str) -> AgentResult<Url> {
  Url::parse(s).map_err(|e| AgentError::Corrupt(format!("url '{}': {}", s, e)))
}

/// Parse a stored RFC 3339 timestamp.
fn parse_datetime(s: &str) -> AgentResult<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| AgentError::Corrupt(format!("timestamp '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::network::Response;

  fn storage() -> SqliteStorage {
    SqliteStorage::new(Database::open_in_memory().unwrap())
  }

  fn entry(url: &str, body: &str) -> StoredResponse {
    let url = Url::parse(url).unwrap();
    let response = Response {
      status: 200,
      headers: vec![("content-type".into(), "text/plain".into())],
      body: body.as_bytes().to_vec(),
      url: url.clone(),
    };
    StoredResponse::capture(&Request::get(url), &response)
  }

  #[test]
  fn test_put_then_get() {
    let storage = storage();
    storage.activate_generation("v1").unwrap();

    let e = entry("https://app.example.com/a", "hello");
    storage.put("v1", &e).unwrap();

    let got = storage.get("v1", &e.fingerprint).unwrap().unwrap();
    assert_eq!(got.body, b"hello");
    assert_eq!(got.headers, e.headers);
    assert_eq!(got.fingerprint, e.fingerprint);
    assert!(storage.get("v2", &e.fingerprint).unwrap().is_none());
  }

  #[test]
  fn test_put_overwrites_wholesale() {
    let storage = storage();
    storage.activate_generation("v1").unwrap();

    storage
      .put("v1", &entry("https://app.example.com/a", "old"))
      .unwrap();
    let new = entry("https://app.example.com/a", "new");
    storage.put("v1", &new).unwrap();

    let got = storage.get("v1", &new.fingerprint).unwrap().unwrap();
    assert_eq!(got.body, b"new");
    assert_eq!(storage.list_fingerprints("v1").unwrap().len(), 1);
  }

  #[test]
  fn test_put_rejected_for_unknown_or_superseded_generation() {
    let storage = storage();
    let e = entry("https://app.example.com/a", "x");
    assert!(matches!(
      storage.put("ghost", &e),
      Err(AgentError::CacheWrite(_))
    ));

    storage.activate_generation("v1").unwrap();
    storage.activate_generation("v2").unwrap();
    assert!(storage.put("v1", &e).is_err());
    assert!(storage.put("v2", &e).is_ok());
  }

  #[test]
  fn test_put_many_is_all_or_nothing() {
    let storage = storage();
    storage
      .set_generation_state("v1", GenerationState::Installing)
      .unwrap();

    let entries = vec![
      entry("https://app.example.com/", "shell"),
      entry("https://app.example.com/app.js", "js"),
    ];
    storage.put_many("v1", &entries).unwrap();
    assert_eq!(storage.list_fingerprints("v1").unwrap().len(), 2);

    assert!(storage.put_many("missing", &entries).is_err());
    assert!(storage.list_fingerprints("missing").unwrap().is_empty());
  }

  #[test]
  fn test_delete_all_except_keeps_only_tag() {
    let storage = storage();
    storage.activate_generation("v1").unwrap();
    storage
      .put("v1", &entry("https://app.example.com/a", "1"))
      .unwrap();
    storage
      .put("v1", &entry("https://app.example.com/b", "1"))
      .unwrap();
    storage
      .set_generation_state("v2", GenerationState::Waiting)
      .unwrap();
    storage
      .put("v2", &entry("https://app.example.com/a", "2"))
      .unwrap();

    storage.activate_generation("v2").unwrap();
    let removed = storage.delete_all_except("v2").unwrap();

    assert_eq!(removed, 2);
    assert!(storage.list_fingerprints("v1").unwrap().is_empty());
    assert_eq!(storage.list_fingerprints("v2").unwrap().len(), 1);

    let generations = storage.generations().unwrap();
    assert_eq!(generations.len(), 1);
    assert_eq!(generations[0].tag, "v2");
    assert_eq!(generations[0].state, GenerationState::Active);
    assert_eq!(generations[0].entries, 1);
  }

  #[test]
  fn test_activate_supersedes_previous() {
    let storage = storage();
    storage.activate_generation("v1").unwrap();
    assert_eq!(storage.active_generation().unwrap().as_deref(), Some("v1"));

    storage.activate_generation("v2").unwrap();
    assert_eq!(storage.active_generation().unwrap().as_deref(), Some("v2"));

    let states: Vec<_> = storage
      .generations()
      .unwrap()
      .into_iter()
      .map(|g| (g.tag, g.state))
      .collect();
    assert!(states.contains(&("v1".to_string(), GenerationState::Superseded)));
    assert!(states.contains(&("v2".to_string(), GenerationState::Active)));
  }

  #[test]
  fn test_request_url_kept_as_issued() {
    let storage = storage();
    storage.activate_generation("v1").unwrap();

    let issued = entry("https://app.example.com/list?id=2&id=1&flag#top", "list");
    storage.put("v1", &issued).unwrap();

    let equivalent = Fingerprint::new(
      "GET",
      &Url::parse("https://app.example.com/list?flag&id=1&id=2").unwrap(),
    );
    let got = storage.get("v1", &equivalent).unwrap().unwrap();
    assert_eq!(
      got.request_url.as_str(),
      "https://app.example.com/list?id=2&id=1&flag"
    );
    assert_eq!(got.to_response().url, got.request_url);

    let requests = storage.list_requests("v1").unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].url, got.request_url);
  }

  #[test]
  fn test_delete_generation() {
    let storage = storage();
    storage
      .set_generation_state("v9", GenerationState::Installing)
      .unwrap();
    storage
      .put("v9", &entry("https://app.example.com/a", "x"))
      .unwrap();

    storage.delete_generation("v9").unwrap();
    assert!(storage.generations().unwrap().is_empty());
    assert!(storage.list_fingerprints("v9").unwrap().is_empty());
  }
}
