//! Time-boxed read cache for resource mirrors.
//!
//! Entries expire lazily: a read that finds a stale entry evicts it and
//! reports a miss. Any successful write clears the whole cache; the
//! campaign → ad set → ad hierarchy rolls metrics up, so a targeted
//! invalidation would have to know every ancestor that embeds a child.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
struct CacheEntry {
    stored_at: Instant,
    value: Value,
}

#[derive(Debug)]
pub struct TtlCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl TtlCache {
    /// Create an empty cache with the default five-minute TTL.
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    /// Create an empty cache whose entries live for `ttl`.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Lifetime of a stored entry.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the cached value for `key` unless it is older than the TTL.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.lock();
        let entry = entries.get(key)?;
        if entry.stored_at.elapsed() > self.ttl {
            debug!(key, "cache entry expired");
            entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    /// Store `value` under `key`, replacing any previous entry and restarting its TTL.
    pub fn put(&self, key: impl Into<String>, value: Value) {
        self.lock().insert(
            key.into(),
            CacheEntry {
                stored_at: Instant::now(),
                value,
            },
        );
    }

    /// Drop every entry regardless of resource type.
    pub fn invalidate_all(&self) {
        let mut entries = self.lock();
        if !entries.is_empty() {
            debug!(count = entries.len(), "invalidating read cache");
        }
        entries.clear();
    }

    /// Number of stored entries, including ones that have expired but not yet been read.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for TtlCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a cache key from a resource path and its query variant.
///
/// Parameters are sorted so that the same logical query always maps to the
/// same key; credentials are never part of a key.
pub fn cache_key(path: &str, params: &[(&str, String)]) -> String {
    let mut parts: Vec<String> = params
        .iter()
        .filter(|(k, _)| *k != "access_token")
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    parts.sort();

    if parts.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{}", parts.join("&"))
    }
}
