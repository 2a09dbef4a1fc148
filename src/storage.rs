//! Per-file front end of the page cache.
//!
//! A [`PagedStorage`] maps page indexes of one backing store to cached
//! [`Page`]s: it resolves indexes through its own [`PagesTable`], loads
//! missing pages from the [`StorageBackend`] and hands out acquired pages as
//! [`PageGuard`]s.

use crossbeam_channel::{bounded, RecvTimeoutError};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::debug;

use crate::backend::{PageContentLoader, PageStorageHandle, StorageBackend};
use crate::memory::PageBuffer;
use crate::page::{Page, PageGuard, PagesTable};
use crate::store::{CacheInner, Command};
use crate::types::{CacheError, Result};

/// Re-resolve attempts for a page index that keeps being reclaimed
const MAX_RESOLVE_ATTEMPTS: u32 = 1000;

/// Attempts that just yield before backing off with a sleep
const RESOLVE_SPINS: u32 = 16;
const RESOLVE_BACKOFF: Duration = Duration::from_micros(50);

/// How often a closer waiting on the housekeeper checks it is still alive
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Receives page notifications on behalf of one storage
pub struct StorageHandle {
    backend: Arc<dyn StorageBackend>,
    dirty_pages: AtomicUsize,

    /// End of the highest byte modified through the cache
    modified_extent: AtomicU64,
}

impl StorageHandle {
    fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            dirty_pages: AtomicUsize::new(0),
            modified_extent: AtomicU64::new(0),
        }
    }

    pub fn dirty_pages(&self) -> usize {
        self.dirty_pages.load(Ordering::Acquire)
    }

    pub fn modified_extent(&self) -> u64 {
        self.modified_extent.load(Ordering::Acquire)
    }
}

impl PageStorageHandle for StorageHandle {
    fn page_become_dirty(&self) {
        self.dirty_pages.fetch_add(1, Ordering::AcqRel);
    }

    fn page_become_clean(&self) {
        let previous = self.dirty_pages.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "page_become_clean() without page_become_dirty()");
    }

    fn modified_region_updated(&self, start_offset_in_file: u64, length: usize) {
        self.modified_extent
            .fetch_max(start_offset_in_file + length as u64, Ordering::AcqRel);
    }

    fn flush_bytes(&self, data: &[u8], offset_in_file: u64) -> io::Result<()> {
        self.backend.write_at(offset_in_file, data)
    }
}

impl std::fmt::Debug for StorageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageHandle")
            .field("dirty_pages", &self.dirty_pages())
            .field("modified_extent", &self.modified_extent())
            .finish()
    }
}

/// Paged view of one backing store, served through a [`PageCache`]
///
/// [`PageCache`]: crate::PageCache
pub struct PagedStorage {
    name: String,
    page_size: u32,
    backend: Arc<dyn StorageBackend>,
    handle: Arc<StorageHandle>,
    table: Arc<PagesTable>,
    cache: Arc<CacheInner>,
    closed: AtomicBool,
}

impl PagedStorage {
    pub(crate) fn new(
        name: String,
        backend: Arc<dyn StorageBackend>,
        table: Arc<PagesTable>,
        cache: Arc<CacheInner>,
    ) -> Self {
        Self {
            name,
            // validated to fit in CacheConfig::validate
            page_size: cache.config.page_size as u32,
            handle: Arc::new(StorageHandle::new(Arc::clone(&backend))),
            backend,
            table,
            cache,
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn page_size(&self) -> usize {
        self.page_size as usize
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Directory of this storage's pages
    pub fn pages_table(&self) -> &PagesTable {
        &self.table
    }

    /// Acquired page `page_index`, loading it if needed
    ///
    /// Waits while another thread loads the page. If the page is reclaimed
    /// under our feet the index is resolved again, so the returned page is
    /// always a live one.
    pub fn page_by_index(&self, page_index: u32) -> Result<PageGuard> {
        let mut loaded_here = false;
        let mut attempts = 0;
        loop {
            self.check_open()?;

            let page = self.table.lookup_or_create(page_index, |index| {
                self.cache
                    .new_page(index, self.page_size, Arc::clone(&self.handle) as _)
            });
            loaded_here |= page.try_prepare_for_use(self)?;

            match page.try_acquire_for_use() {
                Ok(true) => {
                    if self.is_closed() {
                        // raced with close(): nobody else will reclaim this page
                        page.release();
                        if page.try_move_towards_pre_tombstone(/* entomb_young: */ true) {
                            self.cache.unmap_page_and_reclaim_buffer(&page);
                        }
                        return Err(CacheError::StorageClosed);
                    }
                    self.cache.statistics.record_page_request(!loaded_here);
                    return Ok(PageGuard::new(page));
                }
                Ok(false) => thread::yield_now(),
                Err(e @ CacheError::PageUnavailable { .. }) => {
                    attempts += 1;
                    if attempts >= MAX_RESOLVE_ATTEMPTS {
                        return Err(e);
                    }
                    if attempts < RESOLVE_SPINS {
                        thread::yield_now();
                    } else {
                        thread::sleep(RESOLVE_BACKOFF);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Acquired page containing byte `offset`
    pub fn page_by_offset(&self, offset: u64) -> Result<PageGuard> {
        let page_index = u32::try_from(offset / self.page_size as u64).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("offset {offset} is beyond the last addressable page"),
            )
        })?;
        self.page_by_index(page_index)
    }

    /// Cached live page `page_index`, without loading or acquiring it
    pub fn lookup_if_cached(&self, page_index: u32) -> Option<Arc<Page>> {
        self.table.lookup_if_exist(page_index)
    }

    /// Fill `destination` with the bytes at `offset`, page by page
    pub fn read_bytes(&self, offset: u64, destination: &mut [u8]) -> Result<()> {
        let page_size = self.page_size as u64;
        let mut position = offset;
        let mut remaining = destination;
        while !remaining.is_empty() {
            let page = self.page_by_offset(position)?;
            let offset_on_page = (position % page_size) as usize;
            let length = remaining.len().min(self.page_size() - offset_on_page);
            let (head, tail) = remaining.split_at_mut(length);
            page.read_to_array(offset_on_page, head);
            remaining = tail;
            position += length as u64;
        }
        Ok(())
    }

    /// Write `source` at `offset`, page by page
    pub fn write_bytes(&self, offset: u64, source: &[u8]) -> Result<()> {
        let page_size = self.page_size as u64;
        let mut position = offset;
        let mut remaining = source;
        while !remaining.is_empty() {
            let page = self.page_by_offset(position)?;
            let written = page.put_from_buffer((position % page_size) as usize, &mut remaining);
            position += written as u64;
        }
        Ok(())
    }

    /// True if any page of this storage has unflushed modifications
    pub fn is_dirty(&self) -> bool {
        self.handle.dirty_pages() > 0
    }

    /// End of the highest byte modified through the cache
    pub fn modified_extent(&self) -> u64 {
        self.handle.modified_extent()
    }

    /// Flush every dirty page, then sync the backend
    pub fn flush(&self) -> Result<()> {
        self.table.flush_all()?;
        self.backend.sync()?;
        Ok(())
    }

    /// Flush, then reclaim every page of this storage
    ///
    /// With a running housekeeper this blocks until clients released every
    /// page of the storage: never call it while holding one of its pages.
    /// Without a housekeeper pages still in use fail the call with
    /// [`CacheError::PagesStillInUse`]; calling `close` again retries.
    pub fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.flush()?;

        if self.cache.is_closed() || !self.cache.housekeeper_running.load(Ordering::Acquire) {
            return self.cache.close_storage_inline(&self.name, &self.table);
        }

        let (done_tx, done_rx) = bounded(1);
        self.cache
            .commands_tx
            .send(Command::CloseStorage {
                name: self.name.clone(),
                table: Arc::clone(&self.table),
                done: done_tx,
            })
            .map_err(|_| CacheError::CacheClosed)?;
        debug!(storage = %self.name, "page_cache.storage.close_requested");

        loop {
            match done_rx.recv_timeout(CLOSE_POLL_INTERVAL) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Disconnected) => return Err(CacheError::CacheClosed),
                Err(RecvTimeoutError::Timeout) => {
                    if !self.cache.housekeeper_running.load(Ordering::Acquire) {
                        return self.cache.close_storage_inline(&self.name, &self.table);
                    }
                }
            }
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(CacheError::StorageClosed);
        }
        if self.cache.is_closed() {
            return Err(CacheError::CacheClosed);
        }
        Ok(())
    }

    fn load_into(&self, page: &Page, buffer: &mut [u8]) -> io::Result<()> {
        let mut offset = page.offset_in_file();
        let mut filled = 0;
        while filled < buffer.len() {
            match self.backend.read_at(offset, &mut buffer[filled..]) {
                // end of data: the rest of the page stays zeroed
                Ok(0) => break,
                Ok(read) => {
                    filled += read;
                    offset += read as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl PageContentLoader for PagedStorage {
    fn load_page_content(&self, page: &Page) -> Result<PageBuffer> {
        let mut buffer = match self.cache.allocate_page_buffer(page.page_size()) {
            Ok(buffer) => buffer,
            Err(e) => {
                self.cache.statistics.record_page_load(false);
                return Err(e);
            }
        };
        match self.load_into(page, &mut buffer) {
            Ok(()) => {
                self.cache.statistics.record_page_load(true);
                Ok(buffer)
            }
            Err(e) => {
                self.cache.release_page_buffer(buffer);
                self.cache.statistics.record_page_load(false);
                Err(e.into())
            }
        }
    }
}

impl std::fmt::Debug for PagedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagedStorage")
            .field("name", &self.name)
            .field("page_size", &self.page_size)
            .field("table", &self.table)
            .field("handle", &self.handle)
            .field("closed", &self.is_closed())
            .finish()
    }
}
