//! Short-lived per-user cache of merged variant configuration
//!
//! Never authoritative: a miss or expiry always re-derives from the store.
//!
//! Writers take a [`CacheTicket`] before reading the store and present it on
//! insert. Any invalidation in between (per user or a full clear) makes the
//! ticket stale and the insert is dropped, so a slow reader can never put a
//! pre-assignment config back into the cache.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;

use super::clock::Clock;
use super::types::VariantConfig;
use crate::metrics::CONFIG_CACHE_LOOKUPS_TOTAL;

#[derive(Debug, Clone)]
struct CachedConfig {
    config: VariantConfig,
    expires_at: DateTime<Utc>,
}

/// Snapshot of a user's invalidation generation, taken before a store read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTicket {
    epoch: u64,
    generation: u64,
}

pub struct ConfigCache {
    entries: DashMap<String, CachedConfig>,
    /// Per-user invalidation count; reset whenever the epoch moves
    generations: DashMap<String, u64>,
    /// Bumped by `clear`
    epoch: RwLock<u64>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl ConfigCache {
    pub fn new(ttl: std::time::Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            generations: DashMap::new(),
            epoch: RwLock::new(0),
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::days(36_500)),
            clock,
        }
    }

    /// Live entry for the user; expired entries are evicted on access
    pub fn get(&self, user_id: &str) -> Option<VariantConfig> {
        let now = self.clock.now();
        let hit = self
            .entries
            .get(user_id)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.config.clone());

        match hit {
            Some(config) => {
                CONFIG_CACHE_LOOKUPS_TOTAL.with_label_values(&["hit"]).inc();
                Some(config)
            }
            None => {
                self.entries.remove_if(user_id, |_, entry| entry.expires_at <= now);
                CONFIG_CACHE_LOOKUPS_TOTAL.with_label_values(&["miss"]).inc();
                None
            }
        }
    }

    pub fn ticket(&self, user_id: &str) -> CacheTicket {
        let epoch = self.epoch.read();
        CacheTicket {
            epoch: *epoch,
            generation: self.generations.get(user_id).map(|g| *g).unwrap_or(0),
        }
    }

    /// Store a config derived after `ticket` was taken. Returns false when an
    /// invalidation happened in between and the config was discarded.
    pub fn insert(&self, user_id: &str, ticket: CacheTicket, config: VariantConfig) -> bool {
        let epoch = self.epoch.read();
        // Held across the write so invalidate() cannot interleave
        let generation = self.generations.entry(user_id.to_string()).or_insert(0);
        if *epoch != ticket.epoch || *generation != ticket.generation {
            tracing::debug!(user_id = %user_id, "Discarding config derived before invalidation");
            return false;
        }

        let expires_at = self.clock.now() + self.ttl;
        self.entries
            .insert(user_id.to_string(), CachedConfig { config, expires_at });
        true
    }

    pub fn invalidate(&self, user_id: &str) {
        let _epoch = self.epoch.read();
        let mut generation = self.generations.entry(user_id.to_string()).or_insert(0);
        *generation += 1;
        if self.entries.remove(user_id).is_some() {
            tracing::debug!(user_id = %user_id, "Config cache entry invalidated");
        }
    }

    pub fn clear(&self) {
        let mut epoch = self.epoch.write();
        *epoch += 1;
        self.generations.clear();
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::clock::ManualClock;
    use serde_json::json;

    fn config() -> VariantConfig {
        let mut c = VariantConfig::new();
        c.insert("points_multiplier".to_string(), json!(2));
        c
    }

    #[test]
    fn test_entries_expire_after_ttl() {
        let clock = Arc::new(ManualClock::default());
        let cache = ConfigCache::new(std::time::Duration::from_secs(300), clock.clone());

        cache.insert("u1", cache.ticket("u1"), config());
        clock.advance(Duration::seconds(299));
        assert_eq!(cache.get("u1"), Some(config()));

        clock.advance(Duration::seconds(1));
        assert_eq!(cache.get("u1"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_and_clear() {
        let clock = Arc::new(ManualClock::default());
        let cache = ConfigCache::new(std::time::Duration::from_secs(300), clock);

        cache.insert("u1", cache.ticket("u1"), config());
        cache.insert("u2", cache.ticket("u2"), config());
        cache.invalidate("u1");
        assert!(cache.get("u1").is_none());
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.get("u2").is_none());
    }

    #[test]
    fn test_insert_after_invalidation_is_discarded() {
        let clock = Arc::new(ManualClock::default());
        let cache = ConfigCache::new(std::time::Duration::from_secs(300), clock);

        let stale = cache.ticket("u1");
        cache.invalidate("u1");
        assert!(!cache.insert("u1", stale, VariantConfig::new()));
        assert!(cache.get("u1").is_none());

        let fresh = cache.ticket("u1");
        assert!(cache.insert("u1", fresh, config()));
        assert_eq!(cache.get("u1"), Some(config()));
    }

    #[test]
    fn test_insert_after_clear_is_discarded() {
        let clock = Arc::new(ManualClock::default());
        let cache = ConfigCache::new(std::time::Duration::from_secs(300), clock);

        let stale = cache.ticket("u1");
        cache.clear();
        assert!(!cache.insert("u1", stale, config()));
        assert!(cache.is_empty());

        // Other users' tickets are unaffected by a per-user invalidation
        let other = cache.ticket("u2");
        cache.invalidate("u1");
        assert!(cache.insert("u2", other, config()));
    }
}
