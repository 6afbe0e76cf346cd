use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic call counters, mutated only by the dispatcher.
#[derive(Debug, Default)]
pub struct Stats {
    queries: AtomicU64,
    errors: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    deadlocks: AtomicU64,
    retries: AtomicU64,
}

impl Stats {
    pub(crate) fn incr_queries(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_cache_misses(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_deadlocks(&self) {
        self.deadlocks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            deadlocks: self.deadlocks.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of the counters, cheap to hand to observers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub queries: u64,
    pub errors: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub deadlocks: u64,
    pub retries: u64,
}
