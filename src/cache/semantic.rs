//! The semantic response cache.
//!
//! Serves previously computed answers for requests that are identical
//! (exact fingerprint match) or semantically equivalent (embedding cosine
//! above an adaptive threshold) to a past request, and accounts the token
//! cost avoided.
//!
//! # Concurrency
//!
//! The index lives behind a read/write lock; readers share it and the
//! per-entry counters are atomics, so a hit never takes the write lock.
//! Similarity scans run over an `Arc` snapshot of the entry list taken
//! under the read lock, so concurrent mutation cannot tear a scan. The
//! scan yields to the scheduler every [`SCAN_YIELD_STRIDE`] comparisons.

use std::{collections::HashMap, sync::Arc};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::{
    entry::{CacheEntry, answer_size_bytes},
    fingerprint::QueryKey,
    stats::{CacheStats, StatsSnapshot},
};
use crate::{
    api_types::{Answer, AnswerMode},
    config::CacheConfig,
    embedding::cosine,
    observability::metrics,
};

/// Comparisons between scheduler yields during a full scan.
const SCAN_YIELD_STRIDE: usize = 1024;

/// A successful exact lookup.
#[derive(Debug, Clone)]
pub struct ExactHit {
    pub answer: Answer,
    pub tokens_value: u64,
}

/// A successful similarity lookup.
#[derive(Debug, Clone)]
pub struct SemanticHit {
    pub answer: Answer,
    pub similarity: f64,
    pub source_entry_key: String,
    pub tokens_value: u64,
}

/// A write into the cache.
pub struct PutRequest {
    pub key: QueryKey,
    pub answer: Answer,
    pub tokens_value: u64,
    /// Unit-norm question embedding; `None` keeps the entry out of
    /// semantic lookup.
    pub embedding: Option<Arc<Vec<f64>>>,
    pub semantic_eligible: bool,
}

struct CacheIndex {
    entries: HashMap<String, Arc<CacheEntry>>,
    bytes: usize,
}

pub struct SemanticCache {
    config: CacheConfig,
    index: RwLock<CacheIndex>,
    /// Fingerprints of the most recently created or accessed
    /// semantic-eligible entries, probed before a full scan.
    recent: Mutex<std::collections::VecDeque<String>>,
    stats: CacheStats,
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl SemanticCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            index: RwLock::new(CacheIndex {
                entries: HashMap::new(),
                bytes: 0,
            }),
            recent: Mutex::new(std::collections::VecDeque::new()),
            stats: CacheStats::default(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Exact lookup
    // ─────────────────────────────────────────────────────────────────────

    pub fn get_exact(&self, key: &QueryKey) -> Option<ExactHit> {
        self.get_exact_at(key, now_ms())
    }

    fn get_exact_at(&self, key: &QueryKey, now: i64) -> Option<ExactHit> {
        let entry = {
            let index = self.index.read();
            index.entries.get(&key.fingerprint).cloned()
        }?;

        if entry.is_expired(now) {
            // Known stale: remove and miss. Deliberately no fall-through to
            // semantic lookup, which could resurrect the same stale entry.
            self.remove_entry(&key.fingerprint);
            self.stats.record_expired_purges(1);
            metrics::record_cache_lookup("exact", "expired");
            return None;
        }

        let hits = entry.mark_access(now, &self.config.semantic);
        self.stats.record_exact_hit(entry.tokens_value, hits);
        self.touch_recent(&entry);
        metrics::record_cache_lookup("exact", "hit");
        debug!(key = %key.fingerprint, hits, "cache exact hit");

        Some(ExactHit {
            answer: entry.value.clone(),
            tokens_value: entry.tokens_value,
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Semantic lookup
    // ─────────────────────────────────────────────────────────────────────

    /// Similarity lookup over entries sharing the query's mode and tenant.
    ///
    /// Probes the recently-touched ring first; only on a probe miss does it
    /// scan the full population.
    pub async fn get_semantic(
        &self,
        query_vec: &[f64],
        mode: AnswerMode,
        tenant: Option<&str>,
    ) -> Option<SemanticHit> {
        self.get_semantic_at(query_vec, mode, tenant, now_ms()).await
    }

    async fn get_semantic_at(
        &self,
        query_vec: &[f64],
        mode: AnswerMode,
        tenant: Option<&str>,
        now: i64,
    ) -> Option<SemanticHit> {
        if !self.config.semantic.enabled {
            return None;
        }

        // Fast path: score the recently-touched ring.
        let probe_entries = self.resolve_recent();
        if let Some(hit) = self.best_match(probe_entries.iter(), query_vec, mode, tenant, now)
            && let Some(accepted) = self.accept(hit, now)
        {
            metrics::record_cache_lookup("semantic", "probe_hit");
            return Some(accepted);
        }

        // Full scan over a snapshot.
        let snapshot: Vec<Arc<CacheEntry>> = {
            let index = self.index.read();
            index.entries.values().cloned().collect()
        };
        let mut best: Option<(Arc<CacheEntry>, f64)> = None;
        for (i, entry) in snapshot.iter().enumerate() {
            if i % SCAN_YIELD_STRIDE == SCAN_YIELD_STRIDE - 1 {
                tokio::task::yield_now().await;
            }
            if !Self::eligible(entry, mode, tenant, now) {
                continue;
            }
            let Some(embedding) = &entry.embedding else {
                continue;
            };
            let similarity = cosine(query_vec, embedding);
            if best.as_ref().is_none_or(|(_, s)| similarity > *s) {
                best = Some((entry.clone(), similarity));
            }
        }

        match best.and_then(|hit| self.accept(hit, now)) {
            Some(accepted) => {
                metrics::record_cache_lookup("semantic", "hit");
                Some(accepted)
            }
            None => {
                metrics::record_cache_lookup("semantic", "miss");
                None
            }
        }
    }

    fn eligible(entry: &CacheEntry, mode: AnswerMode, tenant: Option<&str>, now: i64) -> bool {
        entry.semantic_eligible
            && entry.embedding.is_some()
            && !entry.is_expired(now)
            && entry.mode == mode
            && entry.tenant.as_deref() == tenant
    }

    /// Raw top-1 among `entries`; acceptance is decided by [`accept`](Self::accept),
    /// so the probe ring short-circuits only on a genuine acceptance.
    fn best_match<'a>(
        &self,
        entries: impl Iterator<Item = &'a Arc<CacheEntry>>,
        query_vec: &[f64],
        mode: AnswerMode,
        tenant: Option<&str>,
        now: i64,
    ) -> Option<(Arc<CacheEntry>, f64)> {
        let mut best: Option<(Arc<CacheEntry>, f64)> = None;
        for entry in entries {
            if !Self::eligible(entry, mode, tenant, now) {
                continue;
            }
            let Some(embedding) = &entry.embedding else {
                continue;
            };
            let similarity = cosine(query_vec, embedding);
            if best.as_ref().is_none_or(|(_, s)| similarity > *s) {
                best = Some((entry.clone(), similarity));
            }
        }
        best
    }

    fn accept(&self, (entry, similarity): (Arc<CacheEntry>, f64), now: i64) -> Option<SemanticHit> {
        if similarity < entry.acceptance_threshold(&self.config.semantic) {
            return None;
        }
        let hits = entry.mark_access(now, &self.config.semantic);
        self.stats.record_semantic_hit(entry.tokens_value, hits);
        self.touch_recent(&entry);
        debug!(
            key = %entry.key,
            similarity,
            hits,
            "cache semantic hit"
        );
        Some(SemanticHit {
            answer: entry.value.clone(),
            similarity,
            source_entry_key: entry.key.clone(),
            tokens_value: entry.tokens_value,
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────

    pub fn put(&self, request: PutRequest) {
        self.put_at(request, now_ms())
    }

    fn put_at(&self, request: PutRequest, now: i64) {
        let size_bytes = answer_size_bytes(&request.answer);
        let ttl_base_ms = (self.config.ttl_base_secs as i64).saturating_mul(1000);

        let mut index = self.index.write();

        // Same fingerprint: last write wins on the value, the hit counter
        // carries over.
        let carried_hits = match index.entries.remove(&request.key.fingerprint) {
            Some(old) => {
                index.bytes = index.bytes.saturating_sub(old.size_bytes);
                old.hit_count()
            }
            None => 0,
        };

        let entry = Arc::new(CacheEntry::new(
            request.key.fingerprint.clone(),
            request.key.normalized_text.clone(),
            request.key.mode,
            request.key.tenant.clone(),
            request.embedding,
            request.answer,
            size_bytes,
            request.tokens_value,
            request.semantic_eligible,
            ttl_base_ms,
            now,
            carried_hits,
            &self.config.semantic,
        ));

        index.bytes += entry.size_bytes;
        index.entries.insert(entry.key.clone(), entry.clone());
        self.stats.record_tokens_spent(request.tokens_value);

        // Capacity is restored before the write lock is released, so no
        // reader ever observes the cache over its bounds.
        self.enforce_capacity(&mut index, now);
        drop(index);

        if entry.semantic_eligible && entry.embedding.is_some() {
            self.touch_recent(&entry);
        }
        metrics::record_cache_store();
    }

    fn enforce_capacity(&self, index: &mut CacheIndex, now: i64) {
        let over = |index: &CacheIndex| {
            index.entries.len() > self.config.max_entries || index.bytes > self.config.max_bytes
        };
        if !over(index) {
            return;
        }

        // Pass 1: drop everything already expired.
        let expired: Vec<String> = index
            .entries
            .values()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.key.clone())
            .collect();
        for key in &expired {
            if let Some(entry) = index.entries.remove(key) {
                index.bytes = index.bytes.saturating_sub(entry.size_bytes);
            }
        }
        self.stats.record_expired_purges(expired.len() as u64);

        if !over(index) {
            return;
        }

        // Pass 2: evict lowest-utility entries until both bounds hold.
        let mut ranked: Vec<(String, f64)> = index
            .entries
            .values()
            .map(|entry| (entry.key.clone(), entry.utility(now)))
            .collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1));

        let mut evicted = 0u64;
        for (key, _) in ranked {
            if !over(index) {
                break;
            }
            if let Some(entry) = index.entries.remove(&key) {
                index.bytes = index.bytes.saturating_sub(entry.size_bytes);
                evicted += 1;
            }
        }
        self.stats.record_evictions(evicted);
        debug!(
            expired = expired.len(),
            evicted,
            entries = index.entries.len(),
            bytes = index.bytes,
            "cache capacity enforced"
        );
    }

    // ─────────────────────────────────────────────────────────────────────
    // Invalidation
    // ─────────────────────────────────────────────────────────────────────

    /// Drop the entry with this exact fingerprint.
    pub fn invalidate_key(&self, fingerprint: &str) -> usize {
        match self.remove_entry(fingerprint) {
            true => 1,
            false => 0,
        }
    }

    /// Drop every entry whose normalized question starts with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let prefix = super::fingerprint::normalize_text(prefix);
        self.invalidate_when(|entry| entry.normalized_text.starts_with(&prefix))
    }

    /// Drop every entry matching the predicate. Returns how many went.
    pub fn invalidate_when(&self, predicate: impl Fn(&CacheEntry) -> bool) -> usize {
        let mut index = self.index.write();
        let doomed: Vec<String> = index
            .entries
            .values()
            .filter(|entry| predicate(entry))
            .map(|entry| entry.key.clone())
            .collect();
        for key in &doomed {
            if let Some(entry) = index.entries.remove(key) {
                index.bytes = index.bytes.saturating_sub(entry.size_bytes);
            }
        }
        doomed.len()
    }

    /// Drop all expired entries. Run periodically by the purge job.
    pub fn purge_expired(&self) -> usize {
        let now = now_ms();
        let purged = self.invalidate_when(|entry| entry.is_expired(now));
        self.stats.record_expired_purges(purged as u64);
        purged
    }

    fn remove_entry(&self, fingerprint: &str) -> bool {
        let mut index = self.index.write();
        match index.entries.remove(fingerprint) {
            Some(entry) => {
                index.bytes = index.bytes.saturating_sub(entry.size_bytes);
                true
            }
            None => false,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Introspection
    // ─────────────────────────────────────────────────────────────────────

    pub fn record_miss(&self) {
        self.stats.record_miss();
        metrics::record_cache_lookup("exact", "miss");
    }

    pub fn stats(&self) -> StatsSnapshot {
        let (entries, bytes) = {
            let index = self.index.read();
            (index.entries.len(), index.bytes)
        };
        self.stats.snapshot(entries, bytes)
    }

    pub fn len(&self) -> usize {
        self.index.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ─────────────────────────────────────────────────────────────────────
    // Recent-entry ring
    // ─────────────────────────────────────────────────────────────────────

    fn touch_recent(&self, entry: &Arc<CacheEntry>) {
        if !entry.semantic_eligible || entry.embedding.is_none() {
            return;
        }
        let mut recent = self.recent.lock();
        if let Some(position) = recent.iter().position(|key| key == &entry.key) {
            recent.remove(position);
        }
        recent.push_back(entry.key.clone());
        while recent.len() > self.config.semantic.probe_window {
            recent.pop_front();
        }
    }

    fn resolve_recent(&self) -> Vec<Arc<CacheEntry>> {
        let keys: Vec<String> = self.recent.lock().iter().cloned().collect();
        let index = self.index.read();
        keys.iter()
            .filter_map(|key| index.entries.get(key).cloned())
            .collect()
    }
}
