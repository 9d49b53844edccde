//! Versioned response cache.
//!
//! This module provides the generation-scoped cache store that:
//! - Maps request fingerprints to stored responses, per deployment tag
//! - Makes each `put` atomic (readers see the old or the new entry, never a mix)
//! - Evicts whole generations only, never individual entries

mod fingerprint;
mod storage;
mod types;

pub use fingerprint::Fingerprint;
pub use storage::{CacheStorage, GenerationRecord, SqliteStorage};
pub use types::{ServeSource, Served, StoredResponse};
