use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lockfree_page_cache::{
    CacheConfig, CacheError, LockingStrategyKind, MemoryBackend, Page, PageCache, PagedStorage,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const PAGE_SIZE: usize = 1024;

fn config(pages_in_budget: u64, locking: LockingStrategyKind) -> CacheConfig {
    CacheConfig {
        page_size: PAGE_SIZE,
        native_capacity_bytes: pages_in_budget * PAGE_SIZE as u64,
        heap_capacity_bytes: pages_in_budget * PAGE_SIZE as u64 / 4,
        locking,
        maintenance_interval: Duration::from_micros(200),
        ..Default::default()
    }
}

/// Acquire a page, retrying while the budget is momentarily exhausted
fn with_page<R>(storage: &PagedStorage, index: u32, f: impl FnOnce(&Page) -> R) -> R {
    loop {
        match storage.page_by_index(index) {
            Ok(page) => return f(&page),
            Err(CacheError::OutOfMemory { .. }) => thread::sleep(Duration::from_micros(100)),
            Err(e) => panic!("page #{index}: {e}"),
        }
    }
}

fn stress(locking: LockingStrategyKind) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    const THREADS: u32 = 8;
    const PAGES: u32 = 256;
    const ROUNDS: usize = 2_000;

    let backend = Arc::new(MemoryBackend::new());
    let cache = PageCache::new(config(32, locking)).unwrap();
    let storage = cache.register_storage("stress", backend.clone()).unwrap();

    // every thread owns the pages with index % THREADS == thread id, and keeps
    // the last value it wrote to each
    thread::scope(|scope| {
        for id in 0..THREADS {
            let storage = &storage;
            scope.spawn(move || {
                let mut rng = StdRng::seed_from_u64(id as u64);
                let mut written = vec![0i64; PAGES as usize];
                for round in 1..=ROUNDS {
                    let index = rng.gen_range(0..PAGES / THREADS) * THREADS + id;
                    let value = ((round as i64) << 8) | id as i64;
                    with_page(storage, index, |page| {
                        assert_eq!(page.get_long(8), written[index as usize]);
                        page.put_long(8, value);
                    });
                    written[index as usize] = value;
                }
            });
        }
    });

    let usage = cache.memory_usage();
    assert!(usage.native_used <= usage.native_capacity);
    assert!(usage.heap_used <= usage.heap_capacity);
    let stats = cache.stats();
    assert!(stats.pages_reclaimed_native + stats.pages_reclaimed_heap > 0);

    storage.flush().unwrap();
    assert!(!storage.is_dirty());
}

#[test]
fn stress_lock_per_page_under_memory_pressure() {
    stress(LockingStrategyKind::PerPage);
}

#[test]
fn stress_shared_lock_under_memory_pressure() {
    stress(LockingStrategyKind::Shared);
}

#[test]
fn written_data_survives_reclaim() {
    let backend = Arc::new(MemoryBackend::new());
    let cache = PageCache::new(config(8, LockingStrategyKind::PerPage)).unwrap();
    let storage = cache.register_storage("survivor", backend.clone()).unwrap();

    for index in 0..64u32 {
        with_page(&storage, index, |page| page.put_int(0, index as i32 * 3));
    }
    // the budget holds a fraction of the pages: most were written back on reclaim
    for index in 0..64u32 {
        with_page(&storage, index, |page| {
            assert_eq!(page.get_int(0), index as i32 * 3, "page #{index}");
        });
    }
}

#[test]
fn close_while_readers_come_and_go() {
    let cache = PageCache::new(config(64, LockingStrategyKind::PerPage)).unwrap();
    let storage = cache
        .register_storage(
            "closing",
            Arc::new(MemoryBackend::with_content(&[5u8; 16 * PAGE_SIZE])),
        )
        .unwrap();
    let stop = AtomicBool::new(false);

    thread::scope(|scope| {
        for id in 0..4u32 {
            let storage = &storage;
            let stop = &stop;
            scope.spawn(move || {
                let mut index = id;
                while !stop.load(Ordering::Relaxed) {
                    match storage.page_by_index(index % 16) {
                        Ok(page) => assert_eq!(page.get(7), 5),
                        Err(CacheError::StorageClosed) => return,
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                    index += 1;
                }
            });
        }

        thread::sleep(Duration::from_millis(20));
        let closer = scope.spawn(|| storage.close());
        thread::sleep(Duration::from_millis(5));
        stop.store(true, Ordering::Relaxed);
        closer.join().unwrap().unwrap();
    });

    assert!(cache.storage_names().is_empty());
    assert_eq!(cache.memory_usage().total_used(), 0);
}

#[test]
fn housekeeper_stops_with_the_cache() {
    let cache = PageCache::new(config(8, LockingStrategyKind::PerPage)).unwrap();
    let storage = cache
        .register_storage("short-lived", Arc::new(MemoryBackend::new()))
        .unwrap();
    with_page(&storage, 0, |page| page.put(0, 1));

    thread::sleep(Duration::from_millis(10));
    assert!(cache.stats().maintenance_turns_done + cache.stats().maintenance_turns_skipped > 0);

    cache.close().unwrap();
    assert!(matches!(storage.page_by_index(0), Err(CacheError::CacheClosed)));
    assert_eq!(cache.memory_usage().total_used(), 0);
}
