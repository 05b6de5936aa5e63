//! Deterministic broker stream names for tables.
//!
//! Every node derives the same stream name for the same `(database, table)`
//! without coordinating, so the name is a digest of the exact-case input and
//! nothing else.

use crate::config::StreamGranularity;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Number of digest bytes kept in a stream key (rendered as twice as many hex chars).
pub const STREAM_KEY_BYTES: usize = 16;

/// Fixed-length stream identifier derived from a database and table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey(String);

impl StreamKey {
    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StreamKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Compute a stream key without caching.
pub fn compute_stream_key(granularity: StreamGranularity, database: &str, table: &str) -> StreamKey {
    let mut hasher = Sha256::new();
    hasher.update(database.as_bytes());
    if granularity == StreamGranularity::Table {
        hasher.update(b".");
        hasher.update(table.as_bytes());
    }
    let digest = hasher.finalize();
    StreamKey(hex::encode(&digest[..STREAM_KEY_BYTES]))
}

/// Derives and caches stream keys.
///
/// Racing callers may both compute a key for the same input; they produce the
/// same value, so whichever insert lands last is harmless.
#[derive(Debug, Default)]
pub struct StreamNamer {
    granularity: StreamGranularity,
    cache: DashMap<(String, String), StreamKey>,
}

impl StreamNamer {
    /// Create a namer for the given granularity.
    pub fn new(granularity: StreamGranularity) -> Self {
        Self {
            granularity,
            cache: DashMap::new(),
        }
    }

    /// Granularity this namer was configured with.
    pub fn granularity(&self) -> StreamGranularity {
        self.granularity
    }

    /// Stream key for `(database, table)`, computed once and then served from cache.
    pub fn derive_stream_key(&self, database: &str, table: &str) -> StreamKey {
        let table_part = match self.granularity {
            StreamGranularity::Table => table,
            StreamGranularity::Database => "",
        };
        let cache_key = (database.to_string(), table_part.to_string());
        if let Some(key) = self.cache.get(&cache_key) {
            return key.clone();
        }
        let key = compute_stream_key(self.granularity, database, table);
        self.cache.insert(cache_key, key.clone());
        key
    }

    /// Number of cached keys.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}
