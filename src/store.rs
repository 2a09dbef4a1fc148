use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::backend::{PageStorageHandle, StorageBackend};
use crate::lifecycle::{Housekeeper, ReclaimCollector};
use crate::locking::{strategy_for, PageContentLockingStrategy};
use crate::memory::{MemoryManager, MemoryUsage, PageBuffer};
use crate::page::{Page, PageState, PagesTable, TokenPolicy};
use crate::profiling::{CacheStatistics, CacheStats};
use crate::storage::PagedStorage;
use crate::types::{CacheConfig, CacheError, Result};
use crate::util::ClampedCounter;

/// Share of reclaim candidates that should be clean after a maintenance turn
const CLEAN_CANDIDATES_RATIO: f64 = 0.5;

/// Work queued for the housekeeper
pub(crate) enum Command {
    /// Reclaim every page of a closed storage, then reply on `done`
    CloseStorage {
        name: String,
        table: Arc<PagesTable>,
        done: Sender<Result<()>>,
    },
}

/// Housekeeper-only state, behind a mutex so a turn may also be run inline
struct MaintenanceState {
    collector: ReclaimCollector,
    percent_to_reclaim: ClampedCounter,
}

/// Outcome of reclaiming the pages of one closed storage
enum CloseProgress {
    Done,
    /// Pages still held by clients
    InUse(usize),
    /// Pages whose flush failed, parked on the stranded list
    Stranded(usize),
}

/// State shared by the cache front end, its storages and the housekeeper
pub(crate) struct CacheInner {
    pub(crate) config: CacheConfig,
    pub(crate) memory: MemoryManager,
    pub(crate) statistics: CacheStatistics,
    locking: Arc<dyn PageContentLockingStrategy>,

    /// Registered storages by name
    storages: Mutex<HashMap<String, Arc<PagesTable>>>,

    /// Pages probably good to reclaim, least useful first; refilled every turn
    reclaim_tx: Sender<Arc<Page>>,
    reclaim_rx: Receiver<Arc<Page>>,

    pub(crate) commands_tx: Sender<Command>,
    commands_rx: Receiver<Command>,

    /// PRE_TOMBSTONE pages whose flush failed during unmap, retried every turn
    stranded: Mutex<Vec<Arc<Page>>>,

    maintenance: Mutex<MaintenanceState>,

    pub(crate) housekeeper_running: AtomicBool,
    closed: AtomicBool,
}

impl CacheInner {
    fn new(config: CacheConfig) -> Self {
        let (reclaim_tx, reclaim_rx) = unbounded();
        let (commands_tx, commands_rx) = unbounded();
        let percent_to_reclaim = ClampedCounter::new(
            config.min_percent_to_reclaim,
            config.min_percent_to_reclaim,
            config.max_percent_to_reclaim,
        );
        Self {
            memory: MemoryManager::new(
                config.native_capacity_bytes,
                config.heap_capacity_bytes,
                config.max_pooled_native_buffers,
            ),
            statistics: CacheStatistics::new(),
            locking: strategy_for(config.locking),
            storages: Mutex::new(HashMap::new()),
            reclaim_tx,
            reclaim_rx,
            commands_tx,
            commands_rx,
            stranded: Mutex::new(Vec::new()),
            maintenance: Mutex::new(MaintenanceState {
                collector: ReclaimCollector::new(percent_to_reclaim.get()),
                percent_to_reclaim,
            }),
            housekeeper_running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            config,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Fresh NOT_READY_YET page wired to the cache's lock strategy
    pub(crate) fn new_page(
        &self,
        page_index: u32,
        page_size: u32,
        storage: Arc<dyn PageStorageHandle>,
    ) -> Page {
        Page::not_ready(
            page_index,
            page_size,
            storage,
            self.locking.lock_for_page(page_index),
            TokenPolicy {
                per_use: self.config.tokens_per_use,
                initial: self.config.initial_tokens,
            },
        )
    }

    // ---------------------------------------------------------------------
    // Allocation path
    // ---------------------------------------------------------------------

    /// Zero-filled buffer for a page about to be loaded
    ///
    /// Reclaims a few candidates first if the native budget would be
    /// exceeded, then falls back to borrowing from the heap budget.
    pub(crate) fn allocate_page_buffer(&self, size: usize) -> Result<PageBuffer> {
        if self.memory.native_used() + size as u64 > self.memory.native_capacity() {
            self.try_reclaim_enough_pages(size, self.config.max_pages_to_reclaim_at_once);
        }

        let buffer = self
            .memory
            .try_allocate(size, /* allow_above_capacity: */ true)
            .ok_or(CacheError::OutOfMemory { requested: size })?;
        self.statistics
            .record_buffer_allocated(buffer.len(), buffer.is_native());
        Ok(buffer)
    }

    /// Give back a buffer that never made it into a page
    pub(crate) fn release_page_buffer(&self, buffer: PageBuffer) {
        self.statistics
            .record_buffer_reclaimed(buffer.len(), buffer.is_native());
        self.memory.release_buffer(buffer);
    }

    /// Poll up to `max_pages_to_try` candidates, reclaiming until `size`
    /// more bytes fit in the native budget
    ///
    /// Dirty candidates are mostly skipped (flushing is slow): the Nth dirty
    /// one met is taken with probability `N / max_pages_to_try`.
    fn try_reclaim_enough_pages(&self, size: usize, max_pages_to_try: usize) {
        if max_pages_to_try == 0 {
            return;
        }
        let mut rng = rand::thread_rng();
        let mut dirty_skipped = 0usize;
        for _ in 0..max_pages_to_try {
            let Ok(candidate) = self.reclaim_rx.try_recv() else {
                break;
            };
            if !candidate.is_usable() || candidate.usage_count() > 0 {
                continue;
            }
            if candidate.is_dirty() && dirty_skipped <= rng.gen_range(0..max_pages_to_try) {
                dirty_skipped += 1;
                // still a candidate, just not worth a flush right now
                let _ = self.reclaim_tx.send(candidate);
                continue;
            }
            if candidate.try_move_towards_pre_tombstone(false) {
                self.unmap_page_and_reclaim_buffer(&candidate);
                if self.memory.native_used() + size as u64 <= self.memory.native_capacity() {
                    return;
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Reclamation
    // ---------------------------------------------------------------------

    /// Flush, detach and entomb a page this thread moved to PRE_TOMBSTONE
    ///
    /// A failed flush leaves the page dirty in PRE_TOMBSTONE on the stranded
    /// list. Returns whether the page reached TOMBSTONE.
    pub(crate) fn unmap_page_and_reclaim_buffer(&self, page: &Arc<Page>) -> bool {
        if let Err(e) = page.flush() {
            warn!(
                page_index = page.page_index(),
                error = %e,
                "page_cache.unmap.flush_failed"
            );
            self.statistics.record_page_stranded();
            self.stranded.lock().push(Arc::clone(page));
            return false;
        }
        self.reclaim_clean_pre_tombstone(page);
        true
    }

    fn reclaim_clean_pre_tombstone(&self, page: &Page) {
        if let Some(buffer) = page.detach_tombstone_buffer() {
            self.release_page_buffer(buffer);
        }
        page.entomb();
    }

    /// Retry the flush of stranded pages; returns how many are still stranded
    fn retry_stranded_pages(&self) -> usize {
        self.retry_stranded_where(|_| true)
    }

    /// Retry the stranded pages of one storage; returns how many of its pages
    /// are still stranded
    fn retry_stranded_in(&self, table: &PagesTable) -> usize {
        let live = table.pages_snapshot();
        self.retry_stranded_where(|page| live.iter().any(|p| Arc::ptr_eq(p, page)))
    }

    fn retry_stranded_where(&self, selected: impl Fn(&Arc<Page>) -> bool) -> usize {
        let stranded = std::mem::take(&mut *self.stranded.lock());
        let mut kept = Vec::new();
        let mut remaining = 0;
        for page in stranded {
            if !selected(&page) {
                kept.push(page);
                continue;
            }
            match page.flush() {
                Ok(()) => self.reclaim_clean_pre_tombstone(&page),
                Err(_) => {
                    remaining += 1;
                    kept.push(page);
                }
            }
        }
        self.stranded.lock().extend(kept);
        remaining
    }

    /// Move every page of a closed storage towards TOMBSTONE
    fn reclaim_storage_pages(&self, table: &PagesTable) -> CloseProgress {
        let mut in_use = 0;
        for page in table.pages_snapshot() {
            if page.try_move_towards_pre_tombstone(/* entomb_young: */ true) {
                self.unmap_page_and_reclaim_buffer(&page);
            } else if page.state() < PageState::PreTombstone {
                in_use += 1;
            }
        }
        if in_use > 0 {
            return CloseProgress::InUse(in_use);
        }
        match self.retry_stranded_in(table) {
            0 if table.pages_snapshot().is_empty() => CloseProgress::Done,
            0 => CloseProgress::InUse(table.pages_snapshot().len()),
            stranded => CloseProgress::Stranded(stranded),
        }
    }

    /// Reclaim a closed storage right now, without the housekeeper
    pub(crate) fn close_storage_inline(&self, name: &str, table: &Arc<PagesTable>) -> Result<()> {
        match self.reclaim_storage_pages(table) {
            CloseProgress::Done => {
                self.unregister(name, table);
                Ok(())
            }
            CloseProgress::InUse(count) => Err(CacheError::PagesStillInUse { count }),
            CloseProgress::Stranded(count) => Err(stranded_error(count)),
        }
    }

    fn unregister(&self, name: &str, table: &Arc<PagesTable>) {
        let mut storages = self.storages.lock();
        if storages.get(name).map_or(false, |t| Arc::ptr_eq(t, table)) {
            storages.remove(name);
        }
        drop(storages);
        self.statistics.record_storage_closed();
        debug!(storage = name, "page_cache.storage.closed");
    }

    /// Handle at most one queued command
    fn process_one_command(&self) {
        let Ok(command) = self.commands_rx.try_recv() else {
            return;
        };
        match command {
            Command::CloseStorage { name, table, done } => {
                match self.reclaim_storage_pages(&table) {
                    CloseProgress::Done => {
                        self.unregister(&name, &table);
                        let _ = done.send(Ok(()));
                    }
                    CloseProgress::InUse(count) => {
                        debug!(
                            storage = %name,
                            pages_in_use = count,
                            "page_cache.storage.close_postponed"
                        );
                        // back in line until clients release their pages
                        let _ = self
                            .commands_tx
                            .send(Command::CloseStorage { name, table, done });
                    }
                    CloseProgress::Stranded(count) => {
                        // stays registered so a later close can finish it
                        let _ = done.send(Err(stranded_error(count)));
                    }
                }
            }
        }
    }

    /// Answer every queued command with `CacheClosed`
    pub(crate) fn fail_pending_commands(&self) {
        while let Ok(command) = self.commands_rx.try_recv() {
            match command {
                Command::CloseStorage { done, .. } => {
                    let _ = done.send(Err(CacheError::CacheClosed));
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Maintenance
    // ---------------------------------------------------------------------

    /// Candidates still queued for reclaim
    pub(crate) fn pages_remaining_to_reclaim(&self) -> usize {
        self.reclaim_rx.len()
    }

    /// Candidates the last turn published
    pub(crate) fn pages_prepared_to_reclaim(&self) -> usize {
        self.maintenance.lock().collector.pages_prepared()
    }

    pub(crate) fn has_pending_commands(&self) -> bool {
        !self.commands_rx.is_empty()
    }

    /// Nudge the share of pages prepared for reclaim; returns the new percent
    pub(crate) fn adjust_percent_to_reclaim(&self, more: bool) -> u32 {
        let mut state = self.maintenance.lock();
        if more {
            state.percent_to_reclaim.increment();
        } else {
            state.percent_to_reclaim.decrement();
        }
        state.percent_to_reclaim.get()
    }

    /// One pass of housekeeping over every registered storage
    ///
    /// Returns the first eager flush error; the turn still completes.
    pub(crate) fn do_maintenance_turn(&self) -> Result<()> {
        let mut state = self.maintenance.lock();
        let MaintenanceState {
            collector,
            percent_to_reclaim,
        } = &mut *state;

        self.process_one_command();

        let tables: Vec<Arc<PagesTable>> = self.storages.lock().values().cloned().collect();
        collector.start_collecting_turn(percent_to_reclaim.get());
        for table in &tables {
            let mut alive = 0;
            for page in table.pages_snapshot() {
                alive += 1;

                let (page_state, usage) = page.state_and_usage();
                if page_state == PageState::AboutToUnmap
                    && usage == 0
                    && page.try_move_towards_pre_tombstone(false)
                {
                    self.unmap_page_and_reclaim_buffer(&page);
                    continue;
                }

                let tokens = if usage > 0 {
                    page.add_tokens(usage.saturating_mul(self.config.tokens_per_use))
                } else {
                    page.decay_tokens(self.config.decay_numerator, self.config.decay_denominator)
                };
                page.set_local_tokens(tokens);
                collector.check_page_good_for_reclaim(&page);
            }
            table.shrink_if_needed(alive);
        }

        // republish: stale candidates of the previous turn are dropped
        let candidates = collector.finish_collecting_turn();
        while self.reclaim_rx.try_recv().is_ok() {}
        for candidate in candidates {
            let _ = self.reclaim_tx.send(candidate);
        }

        let (flushed, flush_error) = collector.ensure_enough_clean_pages(CLEAN_CANDIDATES_RATIO);
        self.statistics.record_pages_flushed_eagerly(flushed);
        trace!(
            storages = tables.len(),
            candidates = collector.pages_prepared(),
            threshold = collector.low_usefulness_threshold(),
            percent = percent_to_reclaim.get(),
            flushed,
            "page_cache.maintenance.turn"
        );
        drop(state);

        self.reclaim_overflow();
        self.retry_stranded_pages();
        self.statistics.record_maintenance_turn(false);

        match flush_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Give back heap-borrowed pages while total usage exceeds native capacity
    fn reclaim_overflow(&self) {
        let mut remains = self.config.max_overflow_reclaims_per_turn;
        let mut native_candidates = Vec::new();
        for _ in 0..self.reclaim_rx.len() {
            if remains == 0 || !self.memory.has_overflow() {
                break;
            }
            let Ok(candidate) = self.reclaim_rx.try_recv() else {
                break;
            };
            if !candidate.is_heap_backed() {
                native_candidates.push(candidate);
                continue;
            }
            if candidate.is_usable()
                && candidate.usage_count() == 0
                && candidate.try_move_towards_pre_tombstone(false)
            {
                self.unmap_page_and_reclaim_buffer(&candidate);
                remains -= 1;
            }
        }
        for candidate in native_candidates {
            let _ = self.reclaim_tx.send(candidate);
        }
    }

    /// Reclaim every idle page of every storage, for shutdown
    fn reclaim_all_idle_pages(&self) {
        let tables: Vec<Arc<PagesTable>> = self.storages.lock().values().cloned().collect();
        for table in tables {
            for page in table.pages_snapshot() {
                if page.try_move_towards_pre_tombstone(/* entomb_young: */ true) {
                    self.unmap_page_and_reclaim_buffer(&page);
                }
            }
        }
        self.retry_stranded_pages();
    }
}

fn stranded_error(count: usize) -> CacheError {
    CacheError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("{count} page(s) could not be flushed"),
    ))
}

impl std::fmt::Debug for CacheInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheInner")
            .field("memory", &self.memory)
            .field("storages", &self.storages.lock().len())
            .field("reclaim_queue", &self.reclaim_rx.len())
            .field("stranded", &self.stranded.lock().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Memory-budgeted cache of file pages shared by many storages
///
/// Storages register with [`register_storage`](Self::register_storage) and
/// request pages through the returned [`PagedStorage`]. A background
/// housekeeper decays page usefulness, prepares cold pages for reclaim,
/// flushes dirty ones and reclaims the pages of closed storages.
pub struct PageCache {
    inner: Arc<CacheInner>,
    housekeeper: Mutex<Option<Housekeeper>>,
}

impl PageCache {
    /// Create a cache with the given configuration
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(CacheInner::new(config)),
            housekeeper: Mutex::new(None),
        })
    }

    /// Create a cache with default configuration
    pub fn with_defaults() -> Result<Self> {
        Self::new(CacheConfig::default())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Register a named backing store and get its paged front end
    pub fn register_storage(
        &self,
        name: impl Into<String>,
        backend: Arc<dyn StorageBackend>,
    ) -> Result<Arc<PagedStorage>> {
        if self.inner.is_closed() {
            return Err(CacheError::CacheClosed);
        }
        let name = name.into();
        let table = {
            let mut storages = self.inner.storages.lock();
            if storages.contains_key(&name) {
                return Err(CacheError::StorageAlreadyRegistered(name));
            }
            let table = Arc::new(PagesTable::new(
                self.inner.config.initial_table_size,
                self.inner.config.load_factor,
            ));
            storages.insert(name.clone(), Arc::clone(&table));
            table
        };

        if self.inner.config.start_housekeeper {
            self.ensure_housekeeper_started()?;
        }
        debug!(storage = %name, "page_cache.storage.registered");
        Ok(Arc::new(PagedStorage::new(
            name,
            backend,
            table,
            Arc::clone(&self.inner),
        )))
    }

    fn ensure_housekeeper_started(&self) -> Result<()> {
        let mut housekeeper = self.housekeeper.lock();
        // close() sets the flag before taking this lock
        if housekeeper.is_none() && !self.inner.is_closed() {
            *housekeeper = Some(Housekeeper::start(&self.inner)?);
        }
        Ok(())
    }

    /// Run one maintenance turn on the calling thread
    pub fn run_maintenance_turn(&self) -> Result<()> {
        self.inner.do_maintenance_turn()
    }

    /// Names of the registered storages
    pub fn storage_names(&self) -> Vec<String> {
        self.inner.storages.lock().keys().cloned().collect()
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        self.inner.memory.usage()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.statistics.stats()
    }

    /// Candidates currently queued for reclaim
    pub fn pages_queued_for_reclaim(&self) -> usize {
        self.inner.pages_remaining_to_reclaim()
    }

    /// PRE_TOMBSTONE pages waiting for a successful flush
    pub fn stranded_pages(&self) -> usize {
        self.inner.stranded.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Stop the housekeeper, flush every storage and reclaim idle pages
    ///
    /// Pages still held by clients stay cached until dropped with the cache.
    /// Returns the first flush error.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(housekeeper) = self.housekeeper.lock().take() {
            housekeeper.stop();
        }

        let tables: Vec<Arc<PagesTable>> =
            self.inner.storages.lock().values().cloned().collect();
        let mut first_error = None;
        for table in &tables {
            if let Err(e) = table.flush_all() {
                first_error.get_or_insert(e);
            }
        }
        self.inner.reclaim_all_idle_pages();

        info!(
            storages = tables.len(),
            native_used = self.inner.memory.native_used(),
            heap_used = self.inner.memory.heap_used(),
            "page_cache.closed"
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "page_cache.close_on_drop_failed");
        }
    }
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCache")
            .field("config", &self.inner.config)
            .field("inner", &self.inner)
            .field("housekeeper", &self.housekeeper.lock().is_some())
            .finish()
    }
}
