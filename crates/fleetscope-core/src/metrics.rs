//! Global atomic counters for fleet observability.
//!
//! Counters are incremented at the call site. Call [`Metrics::flush`] at the
//! end of each pass to emit current values as a single `tracing::info!` event.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters.
pub struct Metrics {
    repos_investigated: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    steps_executed: AtomicU64,
    steps_reused: AtomicU64,
    retries: AtomicU64,
    repo_failures: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            repos_investigated: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            steps_executed: AtomicU64::new(0),
            steps_reused: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            repo_failures: AtomicU64::new(0),
        }
    }

    pub fn inc_repos(&self) {
        self.repos_investigated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_misses(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_steps_executed(&self) {
        self.steps_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_steps_reused(&self) {
        self.steps_reused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "retries", "counter incremented");
    }

    pub fn inc_failures(&self) {
        self.repo_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            repos_investigated = self.repos_investigated(),
            cache_hits = self.cache_hits(),
            cache_misses = self.cache_misses(),
            steps_executed = self.steps_executed(),
            steps_reused = self.steps_reused(),
            retries = self.retries(),
            repo_failures = self.repo_failures(),
        );
    }

    pub fn repos_investigated(&self) -> u64 {
        self.repos_investigated.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn steps_executed(&self) -> u64 {
        self.steps_executed.load(Ordering::Relaxed)
    }

    pub fn steps_reused(&self) -> u64 {
        self.steps_reused.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn repo_failures(&self) -> u64 {
        self.repo_failures.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.repos_investigated,
            &self.cache_hits,
            &self.cache_misses,
            &self.steps_executed,
            &self.steps_reused,
            &self.retries,
            &self.repo_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
