//! A process-wide cache of prepared SQL fragments, keyed by a hash of the
//! [`ReferrersRegistry`](crate::referrers::ReferrersRegistry) shape.
//!
//! Mirrors the teacher's `ExecutorCachedState`/`EXECUTOR_CACHE`
//! (`veridit-sql_saga/native/src/executor_cache.rs`): build the expensive
//! (string-formatting) part once per distinct configuration shape, cache
//! it, and serve cache hits without rebuilding. Two differences from the
//! teacher, both because this is a multi-threaded async service rather
//! than one PL/pgSQL call per Postgres backend:
//!
//! - the cache is a `std::sync::RwLock<HashMap<..>>` instead of a
//!   `thread_local!`, since a request is not pinned to one OS thread;
//! - the cache key is hashed with `xxh3` (as the teacher's own
//!   `sweep.rs` does for content hashing) instead of `DefaultHasher`.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::referrers::ReferrersRegistry;

/// The rewrite statements MU needs for one Referrers Registry shape,
/// built once and reused across every MERGE until the registry changes.
#[derive(Debug, Clone)]
pub struct MergeRewriteSql {
    pub statements: Vec<String>,
}

struct CacheEntry {
    sql: MergeRewriteSql,
}

#[derive(Default)]
pub struct ReferrersSqlCache {
    entries: RwLock<HashMap<u64, CacheEntry>>,
    hits: std::sync::atomic::AtomicU64,
    misses: std::sync::atomic::AtomicU64,
}

impl ReferrersSqlCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached rewrite statements for `registry`'s current
    /// shape, building and inserting them on a cache miss.
    pub fn rewrite_sql_for(&self, registry: &ReferrersRegistry) -> MergeRewriteSql {
        let key = registry.shape_hash();

        if let Some(entry) = self.entries.read().expect("cache lock poisoned").get(&key) {
            self.hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return entry.sql.clone();
        }

        self.misses.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let statements = registry
            .entries()
            .iter()
            .map(|r| r.rewrite_sql())
            .collect();
        let sql = MergeRewriteSql { statements };

        self.entries
            .write()
            .expect("cache lock poisoned")
            .insert(key, CacheEntry { sql: sql.clone() });

        sql
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_call_with_same_shape_is_a_cache_hit() {
        let cache = ReferrersSqlCache::new();
        let registry = ReferrersRegistry::default_registry();

        let first = cache.rewrite_sql_for(&registry);
        let second = cache.rewrite_sql_for(&registry);

        assert_eq!(first.statements, second.statements);
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 1);
    }

    #[test]
    fn changed_registry_shape_is_a_miss() {
        let cache = ReferrersSqlCache::new();
        let mut registry = ReferrersRegistry::default_registry();
        cache.rewrite_sql_for(&registry);

        registry.push(crate::referrers::Referrer::new("appointments", "canonical_id"));
        cache.rewrite_sql_for(&registry);

        assert_eq!(cache.misses(), 2);
        assert_eq!(cache.hits(), 0);
    }
}
