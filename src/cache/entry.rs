//! Cache entry model.
//!
//! Entries are shared as `Arc<CacheEntry>`; the fields mutated on every
//! read (hit counter, access time, lazily-refreshed expiry) are atomics so
//! readers holding the shared index lock never need exclusive access.

use std::sync::{
    Arc,
    atomic::{AtomicI64, AtomicU64, Ordering},
};

use crate::{
    api_types::{Answer, AnswerMode},
    config::SemanticCacheConfig,
};

// Utility weights for capacity eviction.
const UTILITY_HIT_WEIGHT: f64 = 1.0;
const UTILITY_TOKEN_WEIGHT: f64 = 0.001;
const UTILITY_AGE_WEIGHT: f64 = 0.0005;

pub struct CacheEntry {
    /// Exact fingerprint.
    pub key: String,
    /// Normalized question text, kept for prefix invalidation.
    pub normalized_text: String,
    pub mode: AnswerMode,
    pub tenant: Option<String>,
    /// Unit-norm question embedding; present iff the entry participates in
    /// semantic lookup.
    pub embedding: Option<Arc<Vec<f64>>>,
    pub value: Answer,
    /// Serialized size of `value`, counted against the byte bound.
    pub size_bytes: usize,
    /// Tokens the stored response cost to produce; credited to
    /// `tokens_saved` on every hit.
    pub tokens_value: u64,
    pub semantic_eligible: bool,
    /// Base TTL in milliseconds.
    pub ttl_base_ms: i64,
    /// Creation time, unix milliseconds.
    pub created_at: i64,
    last_access_at: AtomicI64,
    hit_count: AtomicU64,
    expires_at: AtomicI64,
}

impl CacheEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: String,
        normalized_text: String,
        mode: AnswerMode,
        tenant: Option<String>,
        embedding: Option<Arc<Vec<f64>>>,
        value: Answer,
        size_bytes: usize,
        tokens_value: u64,
        semantic_eligible: bool,
        ttl_base_ms: i64,
        now: i64,
        hit_count: u64,
        config: &SemanticCacheConfig,
    ) -> Self {
        let entry = Self {
            key,
            normalized_text,
            mode,
            tenant,
            embedding,
            value,
            size_bytes,
            tokens_value,
            semantic_eligible,
            ttl_base_ms,
            created_at: now,
            last_access_at: AtomicI64::new(now),
            hit_count: AtomicU64::new(hit_count),
            expires_at: AtomicI64::new(0),
        };
        entry.expires_at.store(
            entry.created_at + entry.adaptive_ttl_ms_with(config, hit_count),
            Ordering::Relaxed,
        );
        entry
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    pub fn last_access_at(&self) -> i64 {
        self.last_access_at.load(Ordering::Relaxed)
    }

    pub fn expires_at(&self) -> i64 {
        self.expires_at.load(Ordering::Relaxed)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at()
    }

    /// TTL grown by popularity: `ttl_base * (1 + factor * min(hits, cap))`.
    ///
    /// The growth parameters live in [`SemanticCacheConfig`] but apply to
    /// every entry, semantic-eligible or not.
    fn adaptive_ttl_ms_with(&self, config: &SemanticCacheConfig, hit_count: u64) -> i64 {
        let capped = hit_count.min(config.ttl_hit_cap as u64) as f64;
        (self.ttl_base_ms as f64 * (1.0 + config.ttl_hit_factor * capped)) as i64
    }

    /// Record a hit: bump the counter, refresh the access time, and extend
    /// the expiry lazily from the new hit count. Returns the new count.
    pub fn mark_access(&self, now: i64, config: &SemanticCacheConfig) -> u64 {
        let hits = self.hit_count.fetch_add(1, Ordering::Relaxed) + 1;
        self.last_access_at.store(now, Ordering::Relaxed);
        self.expires_at.store(
            self.created_at + self.adaptive_ttl_ms_with(config, hits),
            Ordering::Relaxed,
        );
        hits
    }

    /// Similarity a query must reach to reuse this entry. Popular entries
    /// relax towards the floor; the clamp also enforces the ceiling.
    pub fn acceptance_threshold(&self, config: &SemanticCacheConfig) -> f64 {
        let relaxed = config.base_threshold
            - config.hit_count_boost * (1.0 + self.hit_count() as f64).log2();
        relaxed.clamp(config.min_threshold, config.max_threshold)
    }

    /// Eviction utility; lowest goes first.
    pub fn utility(&self, now: i64) -> f64 {
        let age_secs = ((now - self.created_at).max(0) as f64) / 1000.0;
        UTILITY_HIT_WEIGHT * self.hit_count() as f64
            + UTILITY_TOKEN_WEIGHT * self.tokens_value as f64
            - UTILITY_AGE_WEIGHT * age_secs
    }
}

/// Byte size an answer occupies in the cache, by serialized length.
pub fn answer_size_bytes(answer: &Answer) -> usize {
    serde_json::to_vec(answer).map(|v| v.len()).unwrap_or(0)
}
