use std::time::Duration;
use thiserror::Error;

use crate::page::PageState;

/// Which reader-writer lock a page's content is guarded by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockingStrategyKind {
    /// Every page gets its own lock (best isolation, more memory)
    #[default]
    PerPage,

    /// All pages of the cache share one lock (less memory, more contention)
    Shared,
}

/// Configuration for the page cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Size of each page in bytes (default: 64KB)
    pub page_size: usize,

    /// Budget for natively allocated (mmap'd) page buffers (default: 256MB)
    pub native_capacity_bytes: u64,

    /// Budget for heap buffers borrowed once the native budget is exhausted (default: 64MB)
    pub heap_capacity_bytes: u64,

    /// Maximum fraction of occupied directory slots before it grows (default: 0.4)
    pub load_factor: f32,

    /// Expected number of pages per storage, used to size a fresh directory (default: 32)
    pub initial_table_size: usize,

    /// Page content locking (default: one lock per page)
    pub locking: LockingStrategyKind,

    /// Eviction tokens credited per concurrent user on release (default: 8)
    pub tokens_per_use: u32,

    /// Eviction tokens a freshly created page starts with (default: 16)
    pub initial_tokens: u32,

    /// Idle pages keep `decay_numerator / decay_denominator` of their tokens each turn (default: 7/8)
    pub decay_numerator: u32,
    pub decay_denominator: u32,

    /// Bounds for the percentile of least useful pages prepared for reclaim (default: 10..=20)
    pub min_percent_to_reclaim: u32,
    pub max_percent_to_reclaim: u32,

    /// Candidates examined on the allocation path before borrowing from heap (default: 5)
    pub max_pages_to_reclaim_at_once: usize,

    /// Heap-backed pages reclaimed per maintenance turn while over budget (default: 10)
    pub max_overflow_reclaims_per_turn: usize,

    /// Released native buffers kept for reuse, per buffer size (default: 64)
    pub max_pooled_native_buffers: usize,

    /// Housekeeper sleep when allocation pressure is low (default: 1ms)
    pub maintenance_interval: Duration,

    /// Spawn the background housekeeper on first storage registration (default: true)
    pub start_housekeeper: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_size: 64 * 1024,                     // 64KB
            native_capacity_bytes: 256 * 1024 * 1024, // 256MB
            heap_capacity_bytes: 64 * 1024 * 1024,    // 64MB
            load_factor: 0.4,
            initial_table_size: 32,
            locking: LockingStrategyKind::PerPage,
            tokens_per_use: 8,
            initial_tokens: 16,
            decay_numerator: 7,
            decay_denominator: 8,
            min_percent_to_reclaim: 10,
            max_percent_to_reclaim: 20,
            max_pages_to_reclaim_at_once: 5,
            max_overflow_reclaims_per_turn: 10,
            max_pooled_native_buffers: 64,
            maintenance_interval: Duration::from_millis(1),
            start_housekeeper: true,
        }
    }
}

impl CacheConfig {
    /// Create a performance-optimized configuration
    pub fn performance() -> Self {
        Self {
            page_size: 1024 * 1024,                    // 1MB
            native_capacity_bytes: 1024 * 1024 * 1024, // 1GB
            heap_capacity_bytes: 256 * 1024 * 1024,
            max_pooled_native_buffers: 256,
            ..Default::default()
        }
    }

    /// Create a memory-optimized configuration
    pub fn memory_efficient() -> Self {
        Self {
            page_size: 16 * 1024,                    // 16KB
            native_capacity_bytes: 32 * 1024 * 1024, // 32MB
            heap_capacity_bytes: 4 * 1024 * 1024,
            locking: LockingStrategyKind::Shared,
            max_pooled_native_buffers: 8,
            ..Default::default()
        }
    }

    /// Check the configuration for values the cache cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || self.page_size > u32::MAX as usize {
            return Err(CacheError::InvalidConfig(format!(
                "page_size(={}) must be in (0, u32::MAX]",
                self.page_size
            )));
        }
        if self.native_capacity_bytes < self.page_size as u64 {
            return Err(CacheError::InvalidConfig(format!(
                "native_capacity_bytes(={}) must fit at least one page(={})",
                self.native_capacity_bytes, self.page_size
            )));
        }
        if !(self.load_factor > 0.0 && self.load_factor < 1.0) {
            return Err(CacheError::InvalidConfig(format!(
                "load_factor(={}) must be in (0, 1)",
                self.load_factor
            )));
        }
        if self.decay_denominator == 0 || self.decay_numerator > self.decay_denominator {
            return Err(CacheError::InvalidConfig(format!(
                "decay ratio {}/{} must be in [0, 1]",
                self.decay_numerator, self.decay_denominator
            )));
        }
        if self.min_percent_to_reclaim > self.max_percent_to_reclaim
            || self.max_percent_to_reclaim > 100
        {
            return Err(CacheError::InvalidConfig(format!(
                "reclaim percentage bounds {}..={} are invalid",
                self.min_percent_to_reclaim, self.max_percent_to_reclaim
            )));
        }
        Ok(())
    }
}

/// Errors that can occur in the page cache
#[derive(Error, Debug)]
pub enum CacheError {
    /// Page is past USABLE: retrying it is futile, re-resolve the index instead
    #[error("Page #{page_index} is unavailable (state: {state:?})")]
    PageUnavailable { page_index: u32, state: PageState },

    #[error("Storage is already closed")]
    StorageClosed,

    #[error("Page cache is already closed")]
    CacheClosed,

    #[error("Out of memory (failed to allocate page buffer of {requested} bytes)")]
    OutOfMemory { requested: usize },

    #[error("Storage [{0}] is already registered")]
    StorageAlreadyRegistered(String),

    #[error("{count} page(s) are still in use")]
    PagesStillInUse { count: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        CacheConfig::default().validate().unwrap();
        CacheConfig::performance().validate().unwrap();
        CacheConfig::memory_efficient().validate().unwrap();
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let bad_load_factor = CacheConfig {
            load_factor: 1.0,
            ..Default::default()
        };
        assert!(matches!(
            bad_load_factor.validate(),
            Err(CacheError::InvalidConfig(_))
        ));

        let bad_decay = CacheConfig {
            decay_numerator: 9,
            decay_denominator: 8,
            ..Default::default()
        };
        assert!(bad_decay.validate().is_err());

        let tiny_budget = CacheConfig {
            native_capacity_bytes: 10,
            ..Default::default()
        };
        assert!(tiny_budget.validate().is_err());
    }
}
