//! TTL cache for externally fetched authorized-key lists.
//!
//! The cache is advisory: a stale or empty entry can only deny access,
//! never grant it. Entries are keyed by the fully expanded HTTPS URL and
//! carry the server's ETag so refreshes can be conditional.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

/// How long a non-empty key list stays fresh.
pub const CACHE_DURATION_SECS: i64 = 60;
/// How long an empty response stays fresh (shorter, so a transient empty
/// list does not lock a user out for a full minute).
pub const CACHE_EMPTY_DURATION_SECS: i64 = 15;
/// Opportunistic pruning kicks in above this many entries.
const PRUNE_THRESHOLD: usize = 50;

#[derive(Debug, Clone, Default)]
pub struct PubKeyCacheEntry {
    pub lines: Vec<String>,
    pub etag: String,
    pub at: DateTime<Utc>,
}

impl PubKeyCacheEntry {
    fn max_age(&self) -> Duration {
        if self.lines.is_empty() {
            Duration::seconds(CACHE_EMPTY_DURATION_SECS)
        } else {
            Duration::seconds(CACHE_DURATION_SECS)
        }
    }

    pub fn fresh(&self, now: DateTime<Utc>) -> bool {
        now - self.at < self.max_age()
    }
}

/// Key-list cache by URL. Callers hold the server lock while touching it.
#[derive(Debug, Default)]
pub struct PubKeyCache {
    entries: HashMap<String, PubKeyCacheEntry>,
}

impl PubKeyCache {
    /// Look up `url`. Returns the entry (possibly stale, so the ETag can be
    /// reused) and whether it is fresh enough to serve without a fetch.
    /// Prunes old entries when the map has grown past its threshold.
    pub fn get(&mut self, url: &str, now: DateTime<Utc>) -> (PubKeyCacheEntry, bool) {
        if self.entries.len() > PRUNE_THRESHOLD {
            let too_old = Duration::seconds(CACHE_DURATION_SECS * 10);
            self.entries.retain(|_, e| now - e.at <= too_old);
        }
        match self.entries.get(url) {
            Some(entry) => {
                let fresh = entry.fresh(now);
                (entry.clone(), fresh)
            }
            None => (PubKeyCacheEntry::default(), false),
        }
    }

    pub fn insert(&mut self, url: String, entry: PubKeyCacheEntry) {
        self.entries.insert(url, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
