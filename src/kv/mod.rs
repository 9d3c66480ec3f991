//! Process-wide key/value store with per-entry expiry.
//!
//! Independent of any connection. Expiry is checked against wall-clock time
//! at access, so a read never observes expired data; physically removing dead
//! entries happens lazily on access and in the supervisor's periodic purge —
//! the two are externally indistinguishable.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

#[derive(Debug, Clone)]
struct KvEntry {
    value: String,
    /// `None` = never expires.
    expires_at: Option<DateTime<Utc>>,
}

impl KvEntry {
    fn live(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            None => true,
            Some(at) => now < at,
        }
    }
}

#[derive(Debug, Default)]
pub struct GlobalKvStore {
    entries: DashMap<String, KvEntry>,
}

impl GlobalKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key`, overwriting any existing value and its TTL.
    /// `ttl_seconds <= 0` means the entry never expires.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>, ttl_seconds: i64) {
        let expires_at = if ttl_seconds > 0 {
            Some(Utc::now() + Duration::seconds(ttl_seconds))
        } else {
            None
        };
        self.entries.insert(
            key.into(),
            KvEntry {
                value: value.into(),
                expires_at,
            },
        );
    }

    /// Expired entries behave as absent and are dropped on the way out.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = Utc::now();
        match self.entries.get(key) {
            Some(entry) if entry.live(now) => Some(entry.value.clone()),
            Some(entry) => {
                drop(entry);
                self.entries.remove_if(key, |_, e| !e.live(now));
                None
            }
            None => None,
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// True iff a live entry was removed.
    pub fn delete(&self, key: &str) -> bool {
        let now = Utc::now();
        self.entries
            .remove(key)
            .map(|(_, entry)| entry.live(now))
            .unwrap_or(false)
    }

    /// Drop every expired entry. Returns the number purged.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.live(now));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
