//! Versioned account/contract state cache.
//!
//! Entries only move forward: an update whose version does not exceed the
//! cached one is ignored, so applying any permutation of the same updates
//! converges to the highest version. Values are stored behind `Arc`, so a
//! reader holds a complete snapshot even while a writer replaces the entry.
//!
//! Entries live in a sharded [`DashMap`]; the version check and swap for a
//! key happen under that key's shard lock only, so readers and writers of
//! unrelated keys never wait on each other.
//!
//! Capacity is bounded with least-recently-*updated* eviction. The update
//! order is tracked in a side index that only writers touch; reads never
//! promote an entry.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

/// Identifier of a cached ledger object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum StateKey {
    /// A `G...` account id.
    Account(String),
    /// A `C...` contract id.
    Contract(String),
}

impl std::fmt::Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Account(id) => write!(f, "account:{id}"),
            Self::Contract(id) => write!(f, "contract:{id}"),
        }
    }
}

/// One cached snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedState {
    pub payload: Value,
    /// Ledger sequence (or other monotonic version) the payload reflects.
    pub version: u64,
    pub updated_at: Instant,
}

/// Result of [`StateCache::apply_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Updated { previous: u64 },
    /// The update did not advance the version; nothing changed.
    StaleVersionIgnored { current: u64 },
}

impl ApplyOutcome {
    pub fn applied(&self) -> bool {
        !matches!(self, Self::StaleVersionIgnored { .. })
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries.
    pub capacity: usize,
    /// Entries older than this read as absent. `None` keeps them until evicted.
    pub ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl: Some(Duration::from_secs(300)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub total: usize,
    pub expired: usize,
    pub active: usize,
    pub capacity: usize,
}

/// Concurrent state cache. Cheap to clone; clones share entries.
#[derive(Clone)]
pub struct StateCache {
    entries: Arc<DashMap<StateKey, Arc<CachedState>>>,
    /// Update order, least recently updated first. Writers only.
    recency: Arc<Mutex<LruCache<StateKey, ()>>>,
    capacity: usize,
    ttl: Option<Duration>,
}

impl StateCache {
    pub fn new(config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Arc::new(DashMap::with_capacity(capacity.get().min(1024))),
            recency: Arc::new(Mutex::new(LruCache::new(capacity))),
            capacity: capacity.get(),
            ttl: config.ttl,
        }
    }

    fn is_expired(&self, state: &CachedState) -> bool {
        self.ttl
            .map(|ttl| state.updated_at.elapsed() > ttl)
            .unwrap_or(false)
    }

    /// Latest unexpired snapshot for `key`.
    pub fn get(&self, key: &StateKey) -> Option<Arc<CachedState>> {
        let state = self.entries.get(key)?;
        if self.is_expired(state.value()) {
            return None;
        }
        Some(Arc::clone(state.value()))
    }

    /// Store `payload` at `version` unless the cache already holds that
    /// version or a newer one. Expired entries still guard their version.
    pub fn apply_update(&self, key: StateKey, version: u64, payload: Value) -> ApplyOutcome {
        let state = Arc::new(CachedState {
            payload,
            version,
            updated_at: Instant::now(),
        });
        let outcome = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut slot) => {
                let current = slot.get().version;
                if version <= current {
                    tracing::trace!(key = %key, version, current, "stale update ignored");
                    return ApplyOutcome::StaleVersionIgnored { current };
                }
                slot.insert(state);
                ApplyOutcome::Updated { previous: current }
            }
            Entry::Vacant(slot) => {
                slot.insert(state);
                ApplyOutcome::Inserted
            }
        };
        self.touch(key);
        outcome
    }

    /// Record `key` as most recently updated, evicting the least recently
    /// updated entry when over capacity. Must not be called while holding a
    /// shard guard.
    fn touch(&self, key: StateKey) {
        let mut recency = self.recency.lock();
        if !self.entries.contains_key(&key) {
            // Invalidated between the write and here.
            return;
        }
        if let Some((evicted, _)) = recency.push(key.clone(), ()) {
            if evicted != key {
                self.entries.remove(&evicted);
                tracing::debug!(key = %evicted, "state cache full, evicted least recently updated");
            }
        }
    }

    /// Drop `key`; the next update re-establishes its version from scratch.
    pub fn invalidate(&self, key: &StateKey) -> Option<Arc<CachedState>> {
        let mut recency = self.recency.lock();
        recency.pop(key);
        self.entries.remove(key).map(|(_, state)| state)
    }

    pub fn clear(&self) {
        let mut recency = self.recency.lock();
        recency.clear();
        self.entries.clear();
    }

    /// Remove expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let Some(ttl) = self.ttl else {
            return 0;
        };
        let mut recency = self.recency.lock();
        let mut purged = 0;
        self.entries.retain(|key, state| {
            let keep = state.updated_at.elapsed() <= ttl;
            if !keep {
                recency.pop(key);
                purged += 1;
            }
            keep
        });
        purged
    }

    pub fn keys(&self) -> Vec<StateKey> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let mut total = 0;
        let mut expired = 0;
        for entry in self.entries.iter() {
            total += 1;
            if self.is_expired(entry.value()) {
                expired += 1;
            }
        }
        CacheStats {
            total,
            expired,
            active: total - expired,
            capacity: self.capacity,
        }
    }
}

impl Default for StateCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl std::fmt::Debug for StateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCache")
            .field("len", &self.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn account(id: &str) -> StateKey {
        StateKey::Account(id.to_string())
    }

    #[test]
    fn newer_version_replaces_older() {
        let cache = StateCache::default();
        assert_eq!(cache.apply_update(account("GA"), 1, json!({"balance": 10})), ApplyOutcome::Inserted);
        assert_eq!(
            cache.apply_update(account("GA"), 2, json!({"balance": 20})),
            ApplyOutcome::Updated { previous: 1 }
        );
        let state = cache.get(&account("GA")).unwrap();
        assert_eq!(state.version, 2);
        assert_eq!(state.payload["balance"], 20);
    }

    #[test]
    fn equal_or_older_version_is_ignored() {
        let cache = StateCache::default();
        cache.apply_update(account("GA"), 5, json!("five"));
        assert_eq!(
            cache.apply_update(account("GA"), 5, json!("again")),
            ApplyOutcome::StaleVersionIgnored { current: 5 }
        );
        assert!(!cache.apply_update(account("GA"), 3, json!("three")).applied());
        assert_eq!(cache.get(&account("GA")).unwrap().payload, json!("five"));
    }

    #[test]
    fn any_delivery_order_converges_to_max_version() {
        let orders: [&[u64]; 4] = [&[1, 2, 3, 4], &[4, 3, 2, 1], &[2, 4, 1, 3], &[3, 3, 1, 4, 4, 2]];
        for order in orders {
            let cache = StateCache::default();
            for v in order {
                cache.apply_update(account("GB"), *v, json!(v));
            }
            let state = cache.get(&account("GB")).unwrap();
            assert_eq!(state.version, 4, "order {order:?}");
            assert_eq!(state.payload, json!(4));
        }
    }

    #[test]
    fn evicts_least_recently_updated() {
        let cache = StateCache::new(CacheConfig { capacity: 2, ttl: None });
        cache.apply_update(account("A"), 1, json!(1));
        cache.apply_update(account("B"), 1, json!(1));
        // Reads do not refresh recency.
        assert!(cache.get(&account("A")).is_some());
        cache.apply_update(account("C"), 1, json!(1));

        assert!(cache.get(&account("A")).is_none());
        assert!(cache.get(&account("B")).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_hides_and_purges_expired() {
        let cache = StateCache::new(CacheConfig {
            capacity: 10,
            ttl: Some(Duration::from_secs(60)),
        });
        cache.apply_update(StateKey::Contract("CA".into()), 7, json!({}));
        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(cache.get(&StateKey::Contract("CA".into())).is_none());
        let stats = cache.stats();
        assert_eq!((stats.total, stats.expired, stats.active), (1, 1, 0));
        // An expired entry still rejects stale versions.
        assert!(!cache.apply_update(StateKey::Contract("CA".into()), 6, json!({})).applied());
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidate_resets_version() {
        let cache = StateCache::default();
        cache.apply_update(account("GA"), 9, json!(9));
        cache.invalidate(&account("GA"));
        assert_eq!(cache.apply_update(account("GA"), 3, json!(3)), ApplyOutcome::Inserted);
    }

    #[test]
    fn readers_keep_their_snapshot() {
        let cache = StateCache::default();
        cache.apply_update(account("GA"), 1, json!("old"));
        let snapshot = cache.get(&account("GA")).unwrap();
        cache.apply_update(account("GA"), 2, json!("new"));
        assert_eq!(snapshot.payload, json!("old"));
        assert_eq!(cache.get(&account("GA")).unwrap().payload, json!("new"));
    }

    #[test]
    fn concurrent_readers_see_monotonic_versions() {
        let cache = StateCache::new(CacheConfig { capacity: 64, ttl: None });
        let keys: Vec<StateKey> = (0..4).map(|i| account(&format!("G{i}"))).collect();

        std::thread::scope(|scope| {
            for key in &keys {
                let cache = cache.clone();
                scope.spawn(move || {
                    // Interleave stale deliveries with fresh ones.
                    for v in 1..=500u64 {
                        cache.apply_update(key.clone(), v, json!(v));
                        cache.apply_update(key.clone(), v / 2, json!(v / 2));
                    }
                });
            }
            for _ in 0..4 {
                let cache = cache.clone();
                let keys = &keys;
                scope.spawn(move || {
                    let mut seen = vec![0u64; keys.len()];
                    for _ in 0..2_000 {
                        for (i, key) in keys.iter().enumerate() {
                            if let Some(state) = cache.get(key) {
                                assert!(state.version >= seen[i], "version went backwards");
                                assert_eq!(state.payload, json!(state.version));
                                seen[i] = state.version;
                            }
                        }
                    }
                });
            }
        });

        for key in &keys {
            assert_eq!(cache.get(key).unwrap().version, 500);
        }
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn eviction_follows_update_order_across_keys() {
        let cache = StateCache::new(CacheConfig { capacity: 2, ttl: None });
        cache.apply_update(account("A"), 1, json!(1));
        cache.apply_update(account("B"), 1, json!(1));
        // A stale write is not an update and does not refresh A.
        cache.apply_update(account("A"), 1, json!(1));
        cache.apply_update(account("A"), 2, json!(2));
        cache.apply_update(account("C"), 1, json!(1));

        assert!(cache.get(&account("B")).is_none());
        assert_eq!(cache.get(&account("A")).unwrap().version, 2);
        assert_eq!(cache.stats().capacity, 2);
        assert_eq!(cache.len(), 2);
    }
}
