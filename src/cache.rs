//! Semantic search cache.
//!
//! Fused search outcomes are cached against the query embedding, the
//! document scope, and the fusion parameters that produced them. A lookup
//! hits when an entry with the same scope and parameters has a query
//! embedding whose cosine similarity to the new one reaches the configured
//! threshold, so paraphrases of a recent question skip both index lookups.
//!
//! Entries expire after `cache.ttl_secs`. Any change to the indexed corpus
//! (a submission or a deletion) must call [`SemanticCache::invalidate`];
//! entries written before the call are never served again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use serde::Serialize;
use tracing::debug;

use snapmind_core::embedding::cosine_similarity;
use snapmind_core::fusion::FusionParams;

use crate::config::CacheConfig;
use crate::retrieval::SearchOutcome;

struct CacheEntry {
    embedding: Vec<f32>,
    scope: Option<String>,
    params: FusionParams,
    epoch: u64,
    outcome: SearchOutcome,
}

/// Hit and miss counters since the cache was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

impl CacheStats {
    /// Fraction of lookups served from the cache, in `[0, 1]`.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct SemanticCache {
    entries: Cache<u64, Arc<CacheEntry>>,
    threshold: f32,
    next_key: AtomicU64,
    epoch: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SemanticCache {
    pub fn new(max_entries: u64, ttl: Duration, threshold: f32) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();
        Self {
            entries,
            threshold,
            next_key: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// The cache described by `[cache]`, or `None` when it is disabled.
    pub fn from_config(config: &CacheConfig) -> Option<Arc<Self>> {
        config.enabled.then(|| {
            Arc::new(Self::new(
                config.max_entries,
                Duration::from_secs(config.ttl_secs),
                config.similarity_threshold as f32,
            ))
        })
    }

    /// Best cached outcome for a query embedding within `scope`.
    pub fn get(
        &self,
        embedding: &[f32],
        scope: Option<&str>,
        params: &FusionParams,
    ) -> Option<SearchOutcome> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let best = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.epoch == epoch && entry.scope.as_deref() == scope && entry.params == *params
            })
            .map(|(_, entry)| (cosine_similarity(embedding, &entry.embedding), entry))
            .filter(|(similarity, _)| *similarity >= self.threshold)
            .max_by(|a, b| a.0.total_cmp(&b.0));

        match best {
            Some((similarity, entry)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(similarity, "semantic cache hit");
                Some(entry.outcome.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(
        &self,
        embedding: Vec<f32>,
        scope: Option<&str>,
        params: &FusionParams,
        outcome: &SearchOutcome,
    ) {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let entry = CacheEntry {
            embedding,
            scope: scope.map(str::to_string),
            params: params.clone(),
            epoch: self.epoch.load(Ordering::SeqCst),
            outcome: outcome.clone(),
        };
        self.entries.insert(key, Arc::new(entry));
    }

    /// Stop serving every cached outcome. Called whenever the corpus
    /// changes. Stale entries age out through TTL and capacity eviction.
    pub fn invalidate(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        debug!("semantic cache invalidated");
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.epoch.load(Ordering::SeqCst),
        }
    }
}
