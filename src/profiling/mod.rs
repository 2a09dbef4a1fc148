//! Lightweight cache statistics - tracks ONLY current totals
//!
//! Atomic counters bumped fire-and-forget from the hot paths, snapshotted on
//! demand. Nothing here ever blocks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Statistics snapshot
/// Contains both raw counters and derived metrics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    // Buffers
    pub pages_allocated_native: u64,
    pub pages_allocated_heap: u64,
    pub bytes_allocated_native: u64,
    pub bytes_allocated_heap: u64,
    pub pages_reclaimed_native: u64,
    pub pages_reclaimed_heap: u64,
    pub bytes_reclaimed_native: u64,
    pub bytes_reclaimed_heap: u64,

    // Requests
    pub page_requests: u64,
    pub page_hits: u64,
    pub page_loads: u64,
    pub page_load_failures: u64,

    // Housekeeping
    pub maintenance_turns_done: u64,
    pub maintenance_turns_skipped: u64,
    pub storages_closed: u64,
    pub pages_flushed_eagerly: u64,
    pub pages_stranded: u64,

    // Derived
    pub pages_cached: u64,
    pub uptime_secs: u64,
}

impl CacheStats {
    /// Share of requests served by an already loaded page
    #[inline]
    pub fn hit_ratio(&self) -> f64 {
        if self.page_requests > 0 {
            self.page_hits as f64 / self.page_requests as f64
        } else {
            0.0
        }
    }
}

/// Lock-free counters shared by the cache and its housekeeper
#[derive(Debug)]
pub struct CacheStatistics {
    pages_allocated_native: AtomicU64,
    pages_allocated_heap: AtomicU64,
    bytes_allocated_native: AtomicU64,
    bytes_allocated_heap: AtomicU64,
    pages_reclaimed_native: AtomicU64,
    pages_reclaimed_heap: AtomicU64,
    bytes_reclaimed_native: AtomicU64,
    bytes_reclaimed_heap: AtomicU64,

    page_requests: AtomicU64,
    page_hits: AtomicU64,
    page_loads: AtomicU64,
    page_load_failures: AtomicU64,

    maintenance_turns_done: AtomicU64,
    maintenance_turns_skipped: AtomicU64,
    storages_closed: AtomicU64,
    pages_flushed_eagerly: AtomicU64,
    pages_stranded: AtomicU64,

    start_time: Instant,
}

impl Default for CacheStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStatistics {
    pub fn new() -> Self {
        Self {
            pages_allocated_native: AtomicU64::new(0),
            pages_allocated_heap: AtomicU64::new(0),
            bytes_allocated_native: AtomicU64::new(0),
            bytes_allocated_heap: AtomicU64::new(0),
            pages_reclaimed_native: AtomicU64::new(0),
            pages_reclaimed_heap: AtomicU64::new(0),
            bytes_reclaimed_native: AtomicU64::new(0),
            bytes_reclaimed_heap: AtomicU64::new(0),
            page_requests: AtomicU64::new(0),
            page_hits: AtomicU64::new(0),
            page_loads: AtomicU64::new(0),
            page_load_failures: AtomicU64::new(0),
            maintenance_turns_done: AtomicU64::new(0),
            maintenance_turns_skipped: AtomicU64::new(0),
            storages_closed: AtomicU64::new(0),
            pages_flushed_eagerly: AtomicU64::new(0),
            pages_stranded: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Get current statistics snapshot
    pub fn stats(&self) -> CacheStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        let allocated = load(&self.pages_allocated_native) + load(&self.pages_allocated_heap);
        let reclaimed = load(&self.pages_reclaimed_native) + load(&self.pages_reclaimed_heap);

        CacheStats {
            pages_allocated_native: load(&self.pages_allocated_native),
            pages_allocated_heap: load(&self.pages_allocated_heap),
            bytes_allocated_native: load(&self.bytes_allocated_native),
            bytes_allocated_heap: load(&self.bytes_allocated_heap),
            pages_reclaimed_native: load(&self.pages_reclaimed_native),
            pages_reclaimed_heap: load(&self.pages_reclaimed_heap),
            bytes_reclaimed_native: load(&self.bytes_reclaimed_native),
            bytes_reclaimed_heap: load(&self.bytes_reclaimed_heap),

            page_requests: load(&self.page_requests),
            page_hits: load(&self.page_hits),
            page_loads: load(&self.page_loads),
            page_load_failures: load(&self.page_load_failures),

            maintenance_turns_done: load(&self.maintenance_turns_done),
            maintenance_turns_skipped: load(&self.maintenance_turns_skipped),
            storages_closed: load(&self.storages_closed),
            pages_flushed_eagerly: load(&self.pages_flushed_eagerly),
            pages_stranded: load(&self.pages_stranded),

            pages_cached: allocated.saturating_sub(reclaimed),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    pub fn record_buffer_allocated(&self, bytes: usize, native: bool) {
        let (pages, total) = if native {
            (&self.pages_allocated_native, &self.bytes_allocated_native)
        } else {
            (&self.pages_allocated_heap, &self.bytes_allocated_heap)
        };
        pages.fetch_add(1, Ordering::Relaxed);
        total.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_buffer_reclaimed(&self, bytes: usize, native: bool) {
        let (pages, total) = if native {
            (&self.pages_reclaimed_native, &self.bytes_reclaimed_native)
        } else {
            (&self.pages_reclaimed_heap, &self.bytes_reclaimed_heap)
        };
        pages.fetch_add(1, Ordering::Relaxed);
        total.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_page_request(&self, hit: bool) {
        self.page_requests.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.page_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_page_load(&self, succeeded: bool) {
        if succeeded {
            self.page_loads.fetch_add(1, Ordering::Relaxed);
        } else {
            self.page_load_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_maintenance_turn(&self, skipped: bool) {
        if skipped {
            self.maintenance_turns_skipped.fetch_add(1, Ordering::Relaxed);
        } else {
            self.maintenance_turns_done.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_storage_closed(&self) {
        self.storages_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pages_flushed_eagerly(&self, pages: usize) {
        self.pages_flushed_eagerly
            .fetch_add(pages as u64, Ordering::Relaxed);
    }

    pub fn record_page_stranded(&self) {
        self.pages_stranded.fetch_add(1, Ordering::Relaxed);
    }
}
