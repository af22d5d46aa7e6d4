//! Compiled-plan cache.
//!
//! Keyed by an xxh3 hash of the canonical (pretty-printed) query text, the
//! compilation options and the environment variables. Entries are immutable
//! shared plans; the canonical text is kept alongside so a hash collision is
//! treated as a miss. When full, the oldest inserted entry is evicted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use musoq_planner::{CompilationOptions, EnvironmentVariables, QueryPlan};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use crate::config::PlanCacheConfig;

struct CachedPlan {
    canonical: String,
    plan: Arc<QueryPlan>,
    inserted: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct PlanCache {
    config: PlanCacheConfig,
    entries: RwLock<HashMap<u64, CachedPlan>>,
    next_insert: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Cache key for one compilation request.
#[must_use]
pub fn cache_key(
    canonical: &str,
    options: &CompilationOptions,
    environment: &EnvironmentVariables,
) -> u64 {
    let mut buf = Vec::with_capacity(canonical.len() + 16);
    buf.extend_from_slice(canonical.as_bytes());
    buf.push(0);
    buf.push(u8::from(options.use_sort_merge_join));
    buf.push(u8::from(options.use_hash_join));
    let mut positions: Vec<_> = environment.iter().collect();
    positions.sort_by_key(|(position, _)| **position);
    for (position, vars) in positions {
        buf.extend_from_slice(&position.to_le_bytes());
        buf.extend_from_slice(&(vars.len() as u64).to_le_bytes());
        let mut pairs: Vec<_> = vars.iter().collect();
        pairs.sort();
        for (name, value) in pairs {
            push_field(&mut buf, name);
            push_field(&mut buf, value);
        }
    }
    xxh3_64(&buf)
}

// Length-prefixed so no byte inside a name or value can shift a boundary.
fn push_field(buf: &mut Vec<u8>, field: &str) {
    buf.extend_from_slice(&(field.len() as u64).to_le_bytes());
    buf.extend_from_slice(field.as_bytes());
}

impl PlanCache {
    #[must_use]
    pub fn new(config: PlanCacheConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            next_insert: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn get(&self, key: u64, canonical: &str) -> Option<Arc<QueryPlan>> {
        if !self.config.enabled {
            return None;
        }
        let found = self
            .entries
            .read()
            .get(&key)
            .filter(|entry| entry.canonical == canonical)
            .map(|entry| Arc::clone(&entry.plan));
        let counter = if found.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        debug!(target: "musoq.cache", key, hit = found.is_some(), "plan lookup");
        found
    }

    pub fn insert(&self, key: u64, canonical: &str, plan: Arc<QueryPlan>) {
        if !self.config.enabled || self.config.capacity == 0 {
            return;
        }
        let mut entries = self.entries.write();
        if !entries.contains_key(&key) && entries.len() >= self.config.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted)
                .map(|(k, _)| *k);
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(target: "musoq.cache", key = oldest, "plan evicted");
            }
        }
        let inserted = self.next_insert.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            key,
            CachedPlan {
                canonical: canonical.to_owned(),
                plan,
                inserted,
            },
        );
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> PlanCacheStats {
        PlanCacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
