//! # Lock-free Page Cache
//!
//! A concurrent, memory-budgeted cache of fixed-size file pages.
//!
//! ## Features
//!
//! - **Lock-free lookups**: page state and usage count share one atomic word,
//!   the per-file directory is published through epochs
//! - **Memory budget**: native (mmap'd) buffers up to a capacity, then a
//!   bounded heap overflow that is given back first
//! - **Usefulness-based eviction**: pages earn tokens while used and decay
//!   while idle; the least useful ones are prepared for reclaim
//! - **Background housekeeping**: a self-pacing thread flushes, reclaims and
//!   closes storages without blocking page users
//!
//! ## Example
//!
//! ```rust
//! use lockfree_page_cache::{CacheConfig, MemoryBackend, PageCache};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = PageCache::new(CacheConfig {
//!     page_size: 4096,
//!     native_capacity_bytes: 1024 * 1024,
//!     ..Default::default()
//! })?;
//!
//! let backend = Arc::new(MemoryBackend::new());
//! let storage = cache.register_storage("data.bin", backend.clone())?;
//!
//! // Pages are acquired for the lifetime of the guard
//! {
//!     let page = storage.page_by_index(0)?;
//!     page.put_long(16, 42);
//!     assert_eq!(page.get_long(16), 42);
//! }
//!
//! storage.flush()?;
//! assert_eq!(backend.snapshot(16, 8), 42i64.to_be_bytes());
//!
//! storage.close()?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
mod lifecycle;
pub mod locking;
pub mod memory;
pub mod page;
pub mod profiling;
pub mod storage;
pub mod store;
pub mod types;
pub mod util;

pub use backend::{MemoryBackend, PageContentLoader, PageStorageHandle, StorageBackend};
pub use memory::MemoryUsage;
pub use page::{Page, PageGuard, PageState};
pub use profiling::CacheStats;
pub use storage::PagedStorage;
pub use store::PageCache;
pub use types::{CacheConfig, CacheError, LockingStrategyKind, Result};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn small_cache() -> PageCache {
        PageCache::new(CacheConfig {
            page_size: 1024,
            native_capacity_bytes: 16 * 1024,
            heap_capacity_bytes: 4 * 1024,
            start_housekeeper: false,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_basic_put_and_get() {
        let cache = small_cache();
        let storage = cache
            .register_storage("basic", Arc::new(MemoryBackend::new()))
            .unwrap();

        let page = storage.page_by_index(0).unwrap();
        page.put_from_array(0, b"Hello, World!");

        let mut retrieved = [0u8; 13];
        page.read_to_array(0, &mut retrieved);
        assert_eq!(&retrieved, b"Hello, World!");
        assert!(page.is_dirty());
    }

    #[test]
    fn test_multiple_storages_are_independent() {
        let cache = small_cache();
        let first = Arc::new(MemoryBackend::new());
        let second = Arc::new(MemoryBackend::new());
        let a = cache.register_storage("a", first.clone()).unwrap();
        let b = cache.register_storage("b", second.clone()).unwrap();

        a.page_by_index(0).unwrap().put_int(0, 1);
        b.page_by_index(0).unwrap().put_int(0, 2);
        a.flush().unwrap();
        b.flush().unwrap();

        assert_eq!(first.snapshot(0, 4), 1i32.to_be_bytes());
        assert_eq!(second.snapshot(0, 4), 2i32.to_be_bytes());
        let mut names = cache.storage_names();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_many_pages_stay_within_budget() {
        let cache = small_cache();
        let storage = cache
            .register_storage("many", Arc::new(MemoryBackend::new()))
            .unwrap();

        // far more pages than fit: maintenance keeps preparing candidates
        for index in 0..200 {
            if index % 8 == 0 {
                cache.run_maintenance_turn().unwrap();
            }
            match storage.page_by_index(index) {
                Ok(page) => page.put_int(0, index as i32),
                Err(CacheError::OutOfMemory { .. }) => cache.run_maintenance_turn().unwrap(),
                Err(e) => panic!("unexpected error: {e}"),
            }
            let usage = cache.memory_usage();
            assert!(usage.native_used <= usage.native_capacity);
            assert!(usage.heap_used <= usage.heap_capacity);
        }
        assert!(cache.stats().pages_reclaimed_native + cache.stats().pages_reclaimed_heap > 0);
    }
}
