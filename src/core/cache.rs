// src/core/cache.rs

//! TTL-based result cache with amortized sweeping.
//!
//! Keys are a content hash of the query text plus a one-letter TTL-class
//! suffix. Instead of a dedicated background timer, a single "next cleanup"
//! instant is tracked: any insert happening past it triggers a full sweep of
//! expired entries and advances the instant by a fixed interval.

use crate::core::request::TtlClass;
use crate::core::result::QueryResult;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// How far the "next cleanup" instant advances after each sweep.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Derives the cache key for a query. Returns `None` for uncacheable
/// classifications.
pub fn cache_key(text: &str, ttl: TtlClass) -> Option<String> {
    let suffix = ttl.suffix()?;
    let digest = Sha256::digest(text.as_bytes());
    let mut key = hex::encode(digest);
    key.push(suffix);
    Some(key)
}

struct Entry {
    expires_at: Instant,
    result: QueryResult,
}

struct CacheInner {
    entries: HashMap<String, Entry>,
    next_cleanup: Instant,
}

/// Keyed store of short-lived query results, shared across dispatch tasks.
pub struct ResultCache {
    inner: Mutex<CacheInner>,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                next_cleanup: Instant::now() + CLEANUP_INTERVAL,
            }),
        }
    }

    /// Looks up a cached result. An entry found at or past its expiry is
    /// removed on the spot; a live entry is returned by copy and retained.
    pub fn get(&self, key: &str) -> Option<QueryResult> {
        let mut inner = self.inner.lock();
        let expired = match inner.entries.get(key) {
            Some(entry) => entry.expires_at <= Instant::now(),
            None => return None,
        };
        if expired {
            inner.entries.remove(key);
            return None;
        }
        inner.entries.get(key).map(|e| e.result.clone())
    }

    /// Stores a result under `key` for `ttl`. Performs the amortized sweep
    /// first when the cleanup instant has passed.
    pub fn insert(&self, key: String, ttl: Duration, result: QueryResult) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if now >= inner.next_cleanup {
            let before = inner.entries.len();
            inner.entries.retain(|_, e| e.expires_at > now);
            let swept = before - inner.entries.len();
            if swept > 0 {
                debug!("Result cache sweep removed {} expired entries.", swept);
            }
            inner.next_cleanup = now + CLEANUP_INTERVAL;
        }
        inner.entries.insert(
            key,
            Entry {
                expires_at: now + ttl,
                result,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Drops all entries. Used on pool teardown.
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }
}
