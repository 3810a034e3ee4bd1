//! Local record storage.
//!
//! A bounded map from key ids to stored records. Conflicts resolve by the
//! records' `(ts, publisher)` total order: an incoming record replaces the
//! local one only when it is strictly newer. Entries expire on their TTL
//! and the least recently used fall out when the map is full.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::debug;

use crate::common::{Id, Record};

#[derive(Debug, Clone)]
/// A record held by this node, with its local lifecycle state.
pub(crate) struct StoreEntry {
    pub record: Record,
    pub expires_at: Instant,
    /// True only for records this node authored and published.
    pub publisher: bool,
    /// Last time the repair task checked this entry's replicas.
    pub last_repair: Instant,
}

#[derive(Debug)]
pub(crate) struct Storage {
    entries: LruCache<Id, StoreEntry>,
}

impl Storage {
    pub fn new(max_values: usize) -> Self {
        let capacity = NonZeroUsize::new(max_values).unwrap_or(NonZeroUsize::MIN);

        Storage {
            entries: LruCache::new(capacity),
        }
    }

    // === Getters ===

    /// The unexpired entry for a key, if any. An expired entry is removed
    /// on the way.
    pub fn get(&mut self, key: &Id, now: Instant) -> Option<&StoreEntry> {
        if let Some(entry) = self.entries.peek(key) {
            if entry.expires_at <= now {
                self.entries.pop(key);
                return None;
            }
        }

        self.entries.get(key)
    }

    /// Whether an unexpired entry for the key is held, without promoting
    /// it in the LRU order.
    pub fn contains(&self, key: &Id, now: Instant) -> bool {
        self.entries
            .peek(key)
            .map(|entry| entry.expires_at > now)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    // === Public Methods ===

    /// Upsert a record under last-write-wins: applied when no live entry
    /// exists or the incoming record is strictly newer. Returns whether
    /// the record was applied.
    pub fn insert_if_newer(
        &mut self,
        key: Id,
        record: Record,
        ttl: Duration,
        publisher: bool,
        now: Instant,
    ) -> bool {
        if let Some(existing) = self.get(&key, now) {
            if !record.is_newer_than(&existing.record) {
                return false;
            }
        }

        self.entries.put(
            key,
            StoreEntry {
                record,
                expires_at: now + ttl,
                publisher,
                last_repair: now,
            },
        );

        true
    }

    /// Reset an entry's lifetime, e.g. after its author re-announced it.
    pub fn refresh_expiry(&mut self, key: &Id, ttl: Duration, now: Instant) {
        if let Some(entry) = self.entries.peek_mut(key) {
            entry.expires_at = now + ttl;
        }
    }

    /// Drop every expired entry.
    pub fn reap_expired(&mut self, now: Instant) {
        let expired: Vec<Id> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| *key)
            .collect();

        for key in &expired {
            self.entries.pop(key);
        }

        if !expired.is_empty() {
            debug!(count = expired.len(), "Reaped expired records");
        }
    }

    /// Keys and records of unexpired entries this node authored.
    pub fn published_entries(&self, now: Instant) -> Vec<(Id, Record)> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.publisher && entry.expires_at > now)
            .map(|(key, entry)| (*key, entry.record.clone()))
            .collect()
    }

    /// Authored entries whose replicas have not been checked for
    /// `min_age`.
    pub fn repair_candidates(&self, now: Instant, min_age: Duration) -> Vec<(Id, Record)> {
        self.entries
            .iter()
            .filter(|(_, entry)| {
                entry.publisher
                    && entry.expires_at > now
                    && now.duration_since(entry.last_repair) >= min_age
            })
            .map(|(key, entry)| (*key, entry.record.clone()))
            .collect()
    }

    pub fn mark_repaired(&mut self, key: &Id, now: Instant) {
        if let Some(entry) = self.entries.peek_mut(key) {
            entry.last_repair = now;
        }
    }
}
