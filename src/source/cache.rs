//! The row cache: TTL with either synchronous (`simple`) or
//! stale-while-revalidate semantics, keyed by `(source, params_hash)`.
//!
//! Invalidation is generation-based: every write bumps the source's
//! generation and drops its entries *before* the refresh notifier fires, and
//! a fetch that started before the bump can never repopulate the cache
//! (read-your-writes).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use moka::future::Cache;

use crate::prelude::*;
use crate::row::Row;

const MAX_ENTRIES: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub uid: u64,
    pub params: u64,
}

#[derive(Debug)]
pub struct CacheEntry {
    pub rows: Vec<Row>,
    pub fetched_at: Instant,
}

/// Outcome of a cache probe under a given policy.
#[derive(Debug)]
pub enum Lookup {
    /// Within TTL; serve as-is.
    Fresh(Vec<Row>),
    /// Past TTL but present and non-empty; serve and revalidate in the
    /// background (stale-while-revalidate only).
    Stale(Vec<Row>),
    Miss,
}

pub struct SourceCache {
    entries: Cache<CacheKey, Arc<CacheEntry>>,
    /// Source uid → generation, bumped on every invalidation.
    generations: DashMap<u64, u64>,
    /// Source uid → params hashes seen, so invalidation can drop every entry.
    seen_params: DashMap<u64, HashSet<u64>>,
    /// Single-flight guard for background revalidations.
    inflight: DashMap<CacheKey, u64>,
}

impl SourceCache {
    pub fn new() -> Self {
        Self {
            entries: Cache::builder().max_capacity(MAX_ENTRIES).build(),
            generations: DashMap::new(),
            seen_params: DashMap::new(),
            inflight: DashMap::new(),
        }
    }

    pub fn generation(&self, uid: u64) -> u64 {
        self.generations.get(&uid).map(|g| *g).unwrap_or(0)
    }

    pub async fn lookup(&self, key: CacheKey, policy: &CachePolicy) -> Lookup {
        let Some(entry) = self.entries.get(&key) else {
            return Lookup::Miss;
        };

        if entry.fetched_at.elapsed() < policy.ttl {
            return Lookup::Fresh(entry.rows.clone());
        }

        match policy.strategy {
            CacheStrategy::Simple => Lookup::Miss,
            CacheStrategy::StaleWhileRevalidate => {
                if entry.rows.is_empty() {
                    Lookup::Miss
                } else {
                    Lookup::Stale(entry.rows.clone())
                }
            }
        }
    }

    /// Populate the cache, unless the source was invalidated after the fetch
    /// began (`gen_at_start` no longer current).
    pub async fn insert_if_current(&self, key: CacheKey, gen_at_start: u64, rows: Vec<Row>) {
        if self.generation(key.uid) != gen_at_start {
            debug!(uid = key.uid, "dropping fetch result - source invalidated mid-flight");
            return;
        }

        self.seen_params.entry(key.uid).or_default().insert(key.params);
        self.entries
            .insert(
                key,
                Arc::new(CacheEntry {
                    rows,
                    fetched_at: Instant::now(),
                }),
            )
            .await;
    }

    /// Drop every entry for a source and bump its generation. Also abandons
    /// any in-flight revalidation for it.
    pub async fn invalidate(&self, uid: u64) {
        *self.generations.entry(uid).or_insert(0) += 1;

        let params: Vec<u64> = self
            .seen_params
            .get(&uid)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        for p in params {
            self.entries.invalidate(&CacheKey { uid, params: p }).await;
        }
    }

    /// At most one background revalidation per key. Returns false when one
    /// is already running.
    pub fn begin_revalidate(&self, key: CacheKey, gen: u64) -> bool {
        match self.inflight.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(gen);
                true
            }
        }
    }

    pub fn end_revalidate(&self, key: CacheKey) {
        self.inflight.remove(&key);
    }
}

impl Default for SourceCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn row(id: u32) -> Row {
        let mut r = Row::new();
        r.set("id", json!(id));
        r
    }

    fn policy(ttl_ms: u64, strategy: CacheStrategy) -> CachePolicy {
        CachePolicy {
            ttl: Duration::from_millis(ttl_ms),
            strategy,
        }
    }

    #[tokio::test]
    async fn fresh_within_ttl_then_miss() {
        let cache = SourceCache::new();
        let key = CacheKey { uid: 1, params: 0 };
        let simple = policy(50, CacheStrategy::Simple);

        assert!(matches!(cache.lookup(key, &simple).await, Lookup::Miss));

        cache.insert_if_current(key, 0, vec![row(1)]).await;
        assert!(matches!(cache.lookup(key, &simple).await, Lookup::Fresh(_)));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(matches!(cache.lookup(key, &simple).await, Lookup::Miss));
    }

    #[tokio::test]
    async fn swr_serves_stale_nonempty() {
        let cache = SourceCache::new();
        let key = CacheKey { uid: 2, params: 0 };
        let swr = policy(10, CacheStrategy::StaleWhileRevalidate);

        cache.insert_if_current(key, 0, vec![row(1)]).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        match cache.lookup(key, &swr).await {
            Lookup::Stale(rows) => assert_eq!(rows.len(), 1),
            other => panic!("expected stale, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalidation_defeats_stale_serving_and_late_inserts() {
        let cache = SourceCache::new();
        let key = CacheKey { uid: 3, params: 0 };
        let swr = policy(1000, CacheStrategy::StaleWhileRevalidate);

        let gen = cache.generation(key.uid);
        cache.insert_if_current(key, gen, vec![row(1)]).await;

        cache.invalidate(key.uid).await;
        assert!(matches!(cache.lookup(key, &swr).await, Lookup::Miss));

        // A fetch that started before the invalidation must not repopulate.
        cache.insert_if_current(key, gen, vec![row(1)]).await;
        assert!(matches!(cache.lookup(key, &swr).await, Lookup::Miss));
    }

    #[tokio::test]
    async fn single_flight_revalidation() {
        let cache = SourceCache::new();
        let key = CacheKey { uid: 4, params: 0 };

        assert!(cache.begin_revalidate(key, 0));
        assert!(!cache.begin_revalidate(key, 0));

        cache.end_revalidate(key);
        assert!(cache.begin_revalidate(key, 0));
    }
}
