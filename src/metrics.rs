//! Per-environment counters, replacing the thread-unsafe shared singleton
//! pattern with atomics owned by the `Environment`, per spec §9's redesign
//! note on metrics.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    pub cache_hits: AtomicU64,
    pub page_fetches: AtomicU64,
    pub page_allocs: AtomicU64,
    pub flushes: AtomicU64,
    pub blob_allocs: AtomicU64,
    pub blob_frees: AtomicU64,
    pub journal_bytes_written: AtomicU64,
}

/// An immutable point-in-time snapshot, safe to hand out by value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub page_fetches: u64,
    pub page_allocs: u64,
    pub flushes: u64,
    pub blob_allocs: u64,
    pub blob_frees: u64,
    pub journal_bytes_written: u64,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            page_fetches: self.page_fetches.load(Ordering::Relaxed),
            page_allocs: self.page_allocs.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            blob_allocs: self.blob_allocs.load(Ordering::Relaxed),
            blob_frees: self.blob_frees.load(Ordering::Relaxed),
            journal_bytes_written: self.journal_bytes_written.load(Ordering::Relaxed),
        }
    }
}
