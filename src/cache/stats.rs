//! Cache statistics.
//!
//! Cumulative counters are atomics so hot-path reads never take the index
//! lock; `tokens_saved` in particular is exact, with no lost updates. A
//! small ring of per-entry hit counts at hit time gives operators a feel
//! for how concentrated reuse is.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Capacity of the recent per-entry hit-count window.
const HIT_WINDOW: usize = 64;

#[derive(Default)]
pub struct CacheStats {
    exact_hits: AtomicU64,
    semantic_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired_purges: AtomicU64,
    tokens_saved: AtomicU64,
    tokens_spent: AtomicU64,
    recent_entry_hits: Mutex<VecDeque<u64>>,
}

impl CacheStats {
    pub fn record_exact_hit(&self, tokens_value: u64, entry_hit_count: u64) {
        self.exact_hits.fetch_add(1, Ordering::Relaxed);
        self.tokens_saved.fetch_add(tokens_value, Ordering::Relaxed);
        self.push_hit(entry_hit_count);
    }

    pub fn record_semantic_hit(&self, tokens_value: u64, entry_hit_count: u64) {
        self.semantic_hits.fetch_add(1, Ordering::Relaxed);
        self.tokens_saved.fetch_add(tokens_value, Ordering::Relaxed);
        self.push_hit(entry_hit_count);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_expired_purges(&self, count: u64) {
        self.expired_purges.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_tokens_spent(&self, tokens: u64) {
        self.tokens_spent.fetch_add(tokens, Ordering::Relaxed);
    }

    fn push_hit(&self, entry_hit_count: u64) {
        let mut window = self.recent_entry_hits.lock();
        if window.len() == HIT_WINDOW {
            window.pop_front();
        }
        window.push_back(entry_hit_count);
    }

    pub fn snapshot(&self, entries: usize, bytes: usize) -> StatsSnapshot {
        StatsSnapshot {
            exact_hits: self.exact_hits.load(Ordering::Relaxed),
            semantic_hits: self.semantic_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired_purges: self.expired_purges.load(Ordering::Relaxed),
            tokens_saved: self.tokens_saved.load(Ordering::Relaxed),
            tokens_spent: self.tokens_spent.load(Ordering::Relaxed),
            entries,
            bytes,
            recent_entry_hits: self.recent_entry_hits.lock().iter().copied().collect(),
        }
    }
}

/// Point-in-time view of the counters, served by `GET /stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub exact_hits: u64,
    pub semantic_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired_purges: u64,
    pub tokens_saved: u64,
    pub tokens_spent: u64,
    pub entries: usize,
    pub bytes: usize,
    pub recent_entry_hits: Vec<u64>,
}
