//! Time-bounded store for async request snapshots, keyed by task id.

use axum::body::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// The inbound request as handed to an async worker on pickup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRequest {
    /// One value per header name; the last occurrence wins.
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub callback: String,
    pub path: String,
}

#[derive(Debug)]
struct CacheEntry {
    bytes: Bytes,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Concurrent cache of serialized [`PendingRequest`]s.
///
/// Entries stay readable until they expire; reads never remove them. Expired entries are
/// invisible to readers immediately and physically dropped by [`evict_expired`].
///
/// [`evict_expired`]: PendingRequestCache::evict_expired
#[derive(Debug)]
pub struct PendingRequestCache {
    entries: DashMap<String, CacheEntry>,
    default_ttl: Duration,
}

impl PendingRequestCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn insert(&self, key: &str, request: &PendingRequest) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(request)?;
        self.insert_raw(key, Bytes::from(bytes), self.default_ttl);
        Ok(())
    }

    /// Store already-serialized bytes. Replaces any existing entry under `key`.
    pub fn insert_raw(&self, key: &str, bytes: Bytes, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                bytes,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn get_raw(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.is_live(now) {
                return Some(entry.bytes.clone());
            }
        }
        // The read guard above is released before touching the shard for writing.
        self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        None
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
