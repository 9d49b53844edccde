/// Schema for the agent's durable state.
pub const SCHEMA: &str = r#"
-- Cache generations, one row per deployment tag
CREATE TABLE IF NOT EXISTS generations (
    tag TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    activated_at TEXT
);

-- Stored responses keyed by generation and request fingerprint
CREATE TABLE IF NOT EXISTS cache_entries (
    tag TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    request_url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (tag, fingerprint)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_tag ON cache_entries(tag);

-- Pending writes awaiting delivery, ordered by id
CREATE TABLE IF NOT EXISTS outbox (
    id INTEGER PRIMARY KEY,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);
"#;
