use parking_lot::{Mutex, RwLockWriteGuard};
use std::cell::UnsafeCell;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use super::state::{pack, unpack_state, unpack_usage, PageState, MAX_USAGE_COUNT};
use crate::backend::{PageContentLoader, PageStorageHandle};
use crate::locking::PageLock;
use crate::memory::PageBuffer;
use crate::types::{CacheError, Result};

/// How eviction tokens are credited to a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenPolicy {
    /// Tokens credited per concurrent user on release
    pub per_use: u32,

    /// Tokens a freshly created page starts with
    pub initial: u32,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            per_use: 8,
            initial: 16,
        }
    }
}

/// A fixed-size page of a paged file
///
/// `(state, usage_count)` live in one atomic word and are only ever changed by
/// CAS, so state transitions never block. Content is guarded by a
/// reader-writer lock handed out by the locking strategy; it may only be
/// touched while the page is acquired (see [`try_acquire_for_use`]).
///
/// [`try_acquire_for_use`]: Page::try_acquire_for_use
pub struct Page {
    page_index: u32,
    page_size: u32,

    /// `(state << 24) | usage_count`
    state_and_usage: AtomicU32,

    tokens_of_usefulness: AtomicU32,

    /// Housekeeper's snapshot of the tokens, stable while it sorts candidates
    local_tokens: AtomicU32,

    tokens_per_use: u32,

    /// Present in USABLE/ABOUT_TO_UNMAP, and in PRE_TOMBSTONE until detached
    data: UnsafeCell<Option<PageBuffer>>,
    heap_backed: AtomicBool,
    detached: AtomicBool,

    lock: PageLock,

    /// `(max_exclusive << 32) | min`, empty (clean) while `min >= max`
    modified_region: AtomicU64,

    /// Serializes dirty region updates with flushes and buffer detach
    region_lock: Mutex<()>,

    storage: Arc<dyn PageStorageHandle>,
}

// SAFETY: `data` is written only by the thread that won NOT_READY_YET ->
// LOADING (no other thread touches it in that state) and by
// `detach_tombstone_buffer`, which runs in PRE_TOMBSTONE with no users and
// holds the region lock. Every other access holds the content lock, or the
// region lock once the page is past ABOUT_TO_UNMAP.
unsafe impl Sync for Page {}

#[inline]
fn pack_region(min: u32, max_exclusive: u32) -> u64 {
    ((max_exclusive as u64) << 32) | min as u64
}

#[inline]
fn unpack_region(region: u64) -> (u32, u32) {
    (region as u32, (region >> 32) as u32)
}

impl Page {
    /// Create a page in NOT_READY_YET state
    pub fn not_ready(
        page_index: u32,
        page_size: u32,
        storage: Arc<dyn PageStorageHandle>,
        lock: PageLock,
        tokens: TokenPolicy,
    ) -> Self {
        assert!(page_size > 0, "page_size must be > 0");
        Self {
            page_index,
            page_size,
            state_and_usage: AtomicU32::new(pack(PageState::NotReadyYet, 0)),
            tokens_of_usefulness: AtomicU32::new(tokens.initial),
            local_tokens: AtomicU32::new(tokens.initial),
            tokens_per_use: tokens.per_use,
            data: UnsafeCell::new(None),
            heap_backed: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            lock,
            modified_region: AtomicU64::new(pack_region(page_size, 0)),
            region_lock: Mutex::new(()),
            storage,
        }
    }

    pub fn page_index(&self) -> u32 {
        self.page_index
    }

    pub fn page_size(&self) -> usize {
        self.page_size as usize
    }

    pub fn offset_in_file(&self) -> u64 {
        self.page_index as u64 * self.page_size as u64
    }

    pub fn state(&self) -> PageState {
        unpack_state(self.state_and_usage.load(Ordering::Acquire))
    }

    pub fn usage_count(&self) -> u32 {
        unpack_usage(self.state_and_usage.load(Ordering::Acquire))
    }

    /// State and usage count read from a single load
    pub fn state_and_usage(&self) -> (PageState, u32) {
        let word = self.state_and_usage.load(Ordering::Acquire);
        (unpack_state(word), unpack_usage(word))
    }

    pub fn is_usable(&self) -> bool {
        self.state() == PageState::Usable
    }

    pub fn is_tombstone(&self) -> bool {
        self.state() == PageState::Tombstone
    }

    pub fn is_dirty(&self) -> bool {
        let (min, max) = unpack_region(self.modified_region.load(Ordering::Acquire));
        min < max
    }

    /// True if the page's buffer was borrowed from the heap budget
    pub fn is_heap_backed(&self) -> bool {
        self.heap_backed.load(Ordering::Acquire)
    }

    /// True if the page currently owns a buffer
    pub fn has_buffer(&self) -> bool {
        match self.state() {
            PageState::Usable | PageState::AboutToUnmap => true,
            PageState::PreTombstone => {
                let _region = self.region_lock.lock();
                // SAFETY: detach changes `data` only under the region lock
                unsafe { (*self.data.get()).is_some() }
            }
            _ => false,
        }
    }

    /// Content lock of this page (possibly shared with other pages)
    pub fn content_lock(&self) -> &PageLock {
        &self.lock
    }

    // ---------------------------------------------------------------------
    // State machine
    // ---------------------------------------------------------------------

    /// Load the content if nobody did yet
    ///
    /// Only the thread winning NOT_READY_YET -> LOADING invokes `loader`, and
    /// owns the page exclusively until it becomes USABLE. A failed load rolls
    /// the page back to NOT_READY_YET so it may be retried. Returns whether
    /// this call performed the load.
    pub fn try_prepare_for_use<L>(&self, loader: &L) -> Result<bool>
    where
        L: PageContentLoader + ?Sized,
    {
        let not_ready = pack(PageState::NotReadyYet, 0);
        if self
            .state_and_usage
            .compare_exchange(
                not_ready,
                pack(PageState::Loading, 0),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Ok(false);
        }

        let buffer = match loader.load_page_content(self) {
            Ok(buffer) => buffer,
            Err(e) => {
                self.state_and_usage.store(not_ready, Ordering::Release);
                return Err(e);
            }
        };
        if buffer.len() != self.page_size() {
            self.state_and_usage.store(not_ready, Ordering::Release);
            panic!(
                "Bug: loader returned {} bytes for page #{} of size {}",
                buffer.len(),
                self.page_index,
                self.page_size
            );
        }

        self.heap_backed.store(!buffer.is_native(), Ordering::Release);
        // SAFETY: LOADING is owned exclusively by this thread
        unsafe {
            *self.data.get() = Some(buffer);
        }
        self.state_and_usage
            .store(pack(PageState::Usable, 0), Ordering::Release);
        Ok(true)
    }

    /// Register one more user of the page
    ///
    /// `Ok(false)`: not loaded yet, retry later. `Err(PageUnavailable)`: the
    /// page is being reclaimed, retrying is futile, re-resolve the index.
    pub fn try_acquire_for_use(&self) -> Result<bool> {
        loop {
            let word = self.state_and_usage.load(Ordering::Acquire);
            let state = unpack_state(word);
            let usage = unpack_usage(word);

            if state < PageState::Usable {
                return Ok(false);
            }
            if state > PageState::Usable {
                return Err(CacheError::PageUnavailable {
                    page_index: self.page_index,
                    state,
                });
            }
            if usage == MAX_USAGE_COUNT {
                panic!("Bug: page #{} usage count overflow ({usage})", self.page_index);
            }

            if self
                .state_and_usage
                .compare_exchange_weak(
                    word,
                    pack(state, usage + 1),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Ok(true);
            }
        }
    }

    /// Unregister a user, crediting tokens for every user present
    pub fn release(&self) {
        loop {
            let word = self.state_and_usage.load(Ordering::Acquire);
            let state = unpack_state(word);
            let usage = unpack_usage(word);

            if !state.allows_access() || usage == 0 {
                panic!(
                    "Bug: release() of page #{} without matching acquire ({state:?}, usage {usage})",
                    self.page_index
                );
            }

            if self
                .state_and_usage
                .compare_exchange_weak(
                    word,
                    pack(state, usage - 1),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                self.add_tokens(usage.saturating_mul(self.tokens_per_use));
                return;
            }
        }
    }

    /// Advance as far towards PRE_TOMBSTONE as state and usage allow
    ///
    /// NOT_READY_YET goes straight to PRE_TOMBSTONE only with `entomb_young`.
    /// LOADING is left alone. An idle USABLE page passes ABOUT_TO_UNMAP on its
    /// way. Returns whether PRE_TOMBSTONE was reached by this call.
    pub fn try_move_towards_pre_tombstone(&self, entomb_young: bool) -> bool {
        loop {
            let word = self.state_and_usage.load(Ordering::Acquire);
            let state = unpack_state(word);
            let usage = unpack_usage(word);

            let next = match state {
                PageState::NotReadyYet if entomb_young => PageState::PreTombstone,
                PageState::Usable | PageState::AboutToUnmap if usage == 0 => state_after(state),
                _ => return false,
            };

            if self
                .state_and_usage
                .compare_exchange(word, pack(next, 0), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
                && next == PageState::PreTombstone
            {
                return true;
            }
        }
    }

    /// PRE_TOMBSTONE -> TOMBSTONE
    ///
    /// The page must be clean, unused and its buffer already detached.
    pub fn entomb(&self) {
        if self.is_dirty() {
            panic!("Bug: entombing dirty page {self:?}, flush it first");
        }
        if self.has_buffer() {
            panic!("Bug: entombing page {self:?} that still owns a buffer");
        }
        let pre_tombstone = pack(PageState::PreTombstone, 0);
        if let Err(word) = self.state_and_usage.compare_exchange(
            pre_tombstone,
            pack(PageState::Tombstone, 0),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            panic!(
                "Bug: entomb() of page #{} in {:?} with usage {}",
                self.page_index,
                unpack_state(word),
                unpack_usage(word)
            );
        }
    }

    /// Take the buffer out of a PRE_TOMBSTONE page, exactly once
    ///
    /// `None` if the page never got a buffer (entombed young). The page must
    /// be clean. Does not wait for the content lock, like a flush past
    /// ABOUT_TO_UNMAP.
    pub fn detach_tombstone_buffer(&self) -> Option<PageBuffer> {
        let state = self.state();
        if state != PageState::PreTombstone {
            panic!(
                "Bug: detaching buffer of page #{} in {state:?}, only PRE_TOMBSTONE allowed",
                self.page_index
            );
        }
        if self.detached.swap(true, Ordering::AcqRel) {
            panic!("Bug: buffer of page #{} detached twice", self.page_index);
        }

        // PRE_TOMBSTONE with usage 0 admits no reader or writer, so the
        // content lock is not taken
        let _region = self.region_lock.lock();
        if self.is_dirty() {
            panic!("Bug: detaching buffer of dirty page {self:?}");
        }
        // SAFETY: region lock held, page has no users
        unsafe { (*self.data.get()).take() }
    }

    // ---------------------------------------------------------------------
    // Eviction tokens
    // ---------------------------------------------------------------------

    pub fn tokens_of_usefulness(&self) -> u32 {
        self.tokens_of_usefulness.load(Ordering::Acquire)
    }

    /// Saturating add; returns the new value
    pub fn add_tokens(&self, tokens: u32) -> u32 {
        let previous = self
            .tokens_of_usefulness
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(tokens))
            })
            .unwrap_or_else(|current| current);
        previous.saturating_add(tokens)
    }

    /// Multiply tokens by `numerator / denominator`; returns the new value
    pub fn decay_tokens(&self, numerator: u32, denominator: u32) -> u32 {
        assert!(denominator > 0, "denominator must be > 0");
        let scale = |tokens: u32| (tokens as u64 * numerator as u64 / denominator as u64) as u32;
        let previous = self
            .tokens_of_usefulness
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(scale(current))
            })
            .unwrap_or_else(|current| current);
        scale(previous)
    }

    /// Housekeeper's snapshot of the tokens
    pub fn local_tokens(&self) -> u32 {
        self.local_tokens.load(Ordering::Relaxed)
    }

    pub(crate) fn set_local_tokens(&self, tokens: u32) {
        self.local_tokens.store(tokens, Ordering::Relaxed);
    }

    // ---------------------------------------------------------------------
    // Content access: page must be acquired
    // ---------------------------------------------------------------------

    pub fn get(&self, offset_on_page: usize) -> u8 {
        self.read(|content| content[offset_on_page])
    }

    pub fn put(&self, offset_on_page: usize, value: u8) {
        self.write(offset_on_page, 1, |region| region[0] = value);
    }

    pub fn get_int(&self, offset_on_page: usize) -> i32 {
        self.read(|content| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&content[offset_on_page..offset_on_page + 4]);
            i32::from_be_bytes(bytes)
        })
    }

    pub fn put_int(&self, offset_on_page: usize, value: i32) {
        self.write(offset_on_page, 4, |region| {
            region.copy_from_slice(&value.to_be_bytes())
        });
    }

    pub fn get_long(&self, offset_on_page: usize) -> i64 {
        self.read(|content| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&content[offset_on_page..offset_on_page + 8]);
            i64::from_be_bytes(bytes)
        })
    }

    pub fn put_long(&self, offset_on_page: usize, value: i64) {
        self.write(offset_on_page, 8, |region| {
            region.copy_from_slice(&value.to_be_bytes())
        });
    }

    /// Copy `destination.len()` bytes starting at `offset_on_page`
    pub fn read_to_array(&self, offset_on_page: usize, destination: &mut [u8]) {
        let end = offset_on_page + destination.len();
        self.read(|content| destination.copy_from_slice(&content[offset_on_page..end]));
    }

    pub fn put_from_array(&self, offset_on_page: usize, source: &[u8]) {
        self.write(offset_on_page, source.len(), |region| {
            region.copy_from_slice(source)
        });
    }

    /// Copy as much of `source` as fits from `offset_on_page` to the page end
    ///
    /// Advances `source` past the copied bytes and returns their count, so a
    /// caller can spread one buffer over consecutive pages.
    pub fn put_from_buffer(&self, offset_on_page: usize, source: &mut &[u8]) -> usize {
        let length = source.len().min(self.page_size().saturating_sub(offset_on_page));
        let (head, tail) = source.split_at(length);
        self.put_from_array(offset_on_page, head);
        *source = tail;
        length
    }

    /// Run `reader` over the whole page content under the read lock
    pub fn read<R>(&self, reader: impl FnOnce(&[u8]) -> R) -> R {
        let _read = self.lock.read_recursive();
        self.check_valid_for_access();
        // SAFETY: content lock held, page acquired so the buffer stays attached
        let content = unsafe { (*self.data.get()).as_deref() };
        match content {
            Some(content) => reader(content),
            None => panic!("Bug: accessible page {self:?} has no buffer"),
        }
    }

    /// Run `writer` over `[offset_on_page, offset_on_page + length)` under the
    /// write lock and mark the region modified
    pub fn write<R>(
        &self,
        offset_on_page: usize,
        length: usize,
        writer: impl FnOnce(&mut [u8]) -> R,
    ) -> R {
        let write = self.lock.write();
        self.check_valid_for_access();
        // SAFETY: content write lock held, page acquired
        let content = unsafe { (*self.data.get()).as_deref_mut() };
        let result = match content {
            Some(content) => writer(&mut content[offset_on_page..offset_on_page + length]),
            None => panic!("Bug: accessible page {self:?} has no buffer"),
        };
        if length > 0 {
            self.region_modified(&write, offset_on_page, length);
        }
        result
    }

    fn check_valid_for_access(&self) {
        let (state, usage) = self.state_and_usage();
        if !state.allows_access() || usage == 0 {
            panic!(
                "Bug: page #{} accessed while not acquired ({state:?}, usage {usage})",
                self.page_index
            );
        }
    }

    // ---------------------------------------------------------------------
    // Dirty region and flush
    // ---------------------------------------------------------------------

    /// Union `[start, start + length)` into the dirty region
    ///
    /// `write_guard` must be this page's content write lock. Notifies the
    /// storage about the region, and about the clean -> dirty edge.
    pub fn region_modified(
        &self,
        write_guard: &RwLockWriteGuard<'_, ()>,
        start: usize,
        length: usize,
    ) {
        debug_assert!(
            std::ptr::eq(RwLockWriteGuard::rwlock(write_guard), &*self.lock),
            "region_modified() needs this page's own write lock"
        );
        let end = start + length;
        assert!(
            end <= self.page_size(),
            "region [{start}, {end}) is outside page of size {}",
            self.page_size
        );

        let _region = self.region_lock.lock();
        let (min, max) = unpack_region(self.modified_region.load(Ordering::Acquire));
        let was_clean = min >= max;
        self.modified_region.store(
            pack_region(min.min(start as u32), max.max(end as u32)),
            Ordering::Release,
        );

        if was_clean {
            self.storage.page_become_dirty();
        }
        self.storage
            .modified_region_updated(self.offset_in_file() + start as u64, length);
    }

    /// Dirty region as `(min, max_exclusive)`, `None` if clean
    pub fn modified_region(&self) -> Option<(usize, usize)> {
        let (min, max) = unpack_region(self.modified_region.load(Ordering::Acquire));
        (min < max).then_some((min as usize, max as usize))
    }

    /// Write the dirty region back through the storage handle
    ///
    /// Blocks for the read lock, unless the page is past ABOUT_TO_UNMAP and
    /// nobody may hold it legally anymore. Idempotent: a racing second flush
    /// finds the page clean.
    pub fn flush(&self) -> Result<()> {
        if !self.is_dirty() {
            return Ok(());
        }
        if self.state() > PageState::AboutToUnmap {
            return self.flush_region();
        }
        let _read = self.lock.read_recursive();
        self.flush_region()
    }

    /// Like [`flush`](Self::flush), but returns `Ok(false)` instead of
    /// waiting for the content lock
    pub fn try_flush(&self) -> Result<bool> {
        if !self.is_dirty() {
            return Ok(true);
        }
        if self.state() > PageState::AboutToUnmap {
            return self.flush_region().map(|()| true);
        }
        match self.lock.try_read() {
            Some(_read) => self.flush_region().map(|()| true),
            None => Ok(false),
        }
    }

    fn flush_region(&self) -> Result<()> {
        let _region = self.region_lock.lock();
        let (min, max) = unpack_region(self.modified_region.load(Ordering::Acquire));
        if min >= max {
            return Ok(());
        }

        // SAFETY: content lock or post-ABOUT_TO_UNMAP state, plus region lock
        let content = unsafe { (*self.data.get()).as_deref() };
        let Some(content) = content else {
            panic!("Bug: dirty page {self:?} has no buffer");
        };
        self.storage.flush_bytes(
            &content[min as usize..max as usize],
            self.offset_in_file() + min as u64,
        )?;

        self.modified_region
            .store(pack_region(self.page_size, 0), Ordering::Release);
        self.storage.page_become_clean();
        Ok(())
    }
}

/// Next state on the way to PRE_TOMBSTONE for an idle page
fn state_after(state: PageState) -> PageState {
    match state {
        PageState::Usable => PageState::AboutToUnmap,
        _ => PageState::PreTombstone,
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (state, usage) = self.state_and_usage();
        f.debug_struct("Page")
            .field("index", &self.page_index)
            .field("state", &state)
            .field("usage_count", &usage)
            .field("tokens", &self.tokens_of_usefulness())
            .field("modified_region", &self.modified_region())
            .finish()
    }
}

/// An acquired page, released on drop
pub struct PageGuard {
    page: Arc<Page>,
}

impl PageGuard {
    /// Wrap a page the caller has already acquired
    pub(crate) fn new(page: Arc<Page>) -> Self {
        Self { page }
    }

    /// Acquire `page` for the guard's lifetime
    ///
    /// `Ok(None)` if the page is not loaded yet.
    pub fn acquire(page: Arc<Page>) -> Result<Option<Self>> {
        Ok(page.try_acquire_for_use()?.then(|| Self::new(page)))
    }

    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }

    /// Release now rather than at end of scope
    pub fn close(self) {}
}

impl Deref for PageGuard {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.page
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        self.page.release();
    }
}

impl std::fmt::Debug for PageGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PageGuard").field(&*self.page).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::testing::{new_page, usable_page, RecordingHandle};
    use proptest::prelude::*;
    use std::io;
    use std::sync::atomic::AtomicUsize;

    const PAGE_SIZE: u32 = 256;

    #[test]
    fn test_prepare_acquire_release() {
        let handle = RecordingHandle::new();
        let page = Arc::new(new_page(3, PAGE_SIZE, &handle));
        assert_eq!(page.state(), PageState::NotReadyYet);
        assert_eq!(page.offset_in_file(), 3 * PAGE_SIZE as u64);
        assert!(!page.try_acquire_for_use().unwrap(), "not loaded yet");

        let loads = AtomicUsize::new(0);
        let loader = |page: &Page| -> Result<PageBuffer> {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok(PageBuffer::heap(page.page_size()))
        };
        assert!(page.try_prepare_for_use(&loader).unwrap());
        assert!(!page.try_prepare_for_use(&loader).unwrap());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(page.is_usable());
        assert!(page.has_buffer());

        let tokens_before = page.tokens_of_usefulness();
        assert!(page.try_acquire_for_use().unwrap());
        assert!(page.try_acquire_for_use().unwrap());
        assert_eq!(page.usage_count(), 2);

        page.release();
        assert_eq!(page.tokens_of_usefulness(), tokens_before + 2 * 8);
        page.release();
        assert_eq!(page.tokens_of_usefulness(), tokens_before + 2 * 8 + 8);
        assert_eq!(page.usage_count(), 0);
    }

    #[test]
    fn test_failed_load_rolls_back() {
        let handle = RecordingHandle::new();
        let page = new_page(0, PAGE_SIZE, &handle);
        let failing = |_: &Page| -> Result<PageBuffer> {
            Err(io::Error::new(io::ErrorKind::Other, "disk on fire").into())
        };
        assert!(matches!(
            page.try_prepare_for_use(&failing),
            Err(CacheError::Io(_))
        ));
        assert_eq!(page.state(), PageState::NotReadyYet);
        assert!(!page.has_buffer());

        let loader = |page: &Page| -> Result<PageBuffer> { Ok(PageBuffer::heap(page.page_size())) };
        assert!(page.try_prepare_for_use(&loader).unwrap());
        assert!(page.is_usable());
    }

    #[test]
    fn test_full_lifecycle_to_tombstone() {
        let handle = RecordingHandle::new();
        let page = usable_page(1, PAGE_SIZE, &handle);

        {
            let guard = PageGuard::acquire(page.clone()).unwrap().unwrap();
            guard.put_int(4, 0x0102_0304);
            assert!(!page.try_move_towards_pre_tombstone(false), "page in use");
            assert_eq!(page.state(), PageState::Usable);
        }

        assert!(page.try_move_towards_pre_tombstone(false));
        assert_eq!(page.state(), PageState::PreTombstone);
        assert!(matches!(
            page.try_acquire_for_use(),
            Err(CacheError::PageUnavailable {
                page_index: 1,
                state: PageState::PreTombstone
            })
        ));

        page.flush().unwrap();
        assert_eq!(handle.flushes.lock()[0], (PAGE_SIZE as u64 + 4, vec![1, 2, 3, 4]));

        let buffer = page.detach_tombstone_buffer().unwrap();
        assert_eq!(&buffer[4..8], &[1, 2, 3, 4]);
        assert!(!page.has_buffer());
        page.entomb();
        assert!(page.is_tombstone());
    }

    #[test]
    fn test_young_page_entombed_only_on_request() {
        let handle = RecordingHandle::new();
        let page = new_page(0, PAGE_SIZE, &handle);
        assert!(!page.try_move_towards_pre_tombstone(false));
        assert_eq!(page.state(), PageState::NotReadyYet);

        assert!(page.try_move_towards_pre_tombstone(true));
        assert!(page.detach_tombstone_buffer().is_none());
        page.entomb();
        assert!(page.is_tombstone());
    }

    #[test]
    fn test_about_to_unmap_is_terminal_for_acquire() {
        let handle = RecordingHandle::new();
        let page = usable_page(0, PAGE_SIZE, &handle);
        page.state_and_usage
            .store(pack(PageState::AboutToUnmap, 0), Ordering::Release);
        assert!(matches!(
            page.try_acquire_for_use(),
            Err(CacheError::PageUnavailable { .. })
        ));
        assert!(page.try_move_towards_pre_tombstone(false));
    }

    #[test]
    #[should_panic(expected = "without matching acquire")]
    fn test_unpaired_release_panics() {
        let handle = RecordingHandle::new();
        usable_page(0, PAGE_SIZE, &handle).release();
    }

    #[test]
    #[should_panic(expected = "not acquired")]
    fn test_access_without_acquire_panics() {
        let handle = RecordingHandle::new();
        usable_page(0, PAGE_SIZE, &handle).get(0);
    }

    #[test]
    #[should_panic(expected = "entombing dirty page")]
    fn test_entomb_dirty_page_panics() {
        let handle = RecordingHandle::new();
        let page = usable_page(0, PAGE_SIZE, &handle);
        PageGuard::acquire(page.clone()).unwrap().unwrap().put(0, 1);
        assert!(page.try_move_towards_pre_tombstone(false));
        page.entomb();
    }

    #[test]
    #[should_panic(expected = "detached twice")]
    fn test_double_detach_panics() {
        let handle = RecordingHandle::new();
        let page = usable_page(0, PAGE_SIZE, &handle);
        assert!(page.try_move_towards_pre_tombstone(false));
        let _buffer = page.detach_tombstone_buffer();
        let _again = page.detach_tombstone_buffer();
    }

    #[test]
    fn test_content_round_trip_big_endian() {
        let handle = RecordingHandle::new();
        let page = usable_page(0, PAGE_SIZE, &handle);
        let guard = PageGuard::acquire(page).unwrap().unwrap();

        guard.put(0, 0xAB);
        guard.put_int(8, -2);
        guard.put_long(16, 0x0102_0304_0506_0708);
        guard.put_from_array(100, b"hello");

        assert_eq!(guard.get(0), 0xAB);
        assert_eq!(guard.get_int(8), -2);
        assert_eq!(guard.get_long(16), 0x0102_0304_0506_0708);
        guard.read(|content| assert_eq!(&content[16..18], &[1, 2]));

        let mut word = [0u8; 5];
        guard.read_to_array(100, &mut word);
        assert_eq!(&word, b"hello");
    }

    #[test]
    fn test_put_from_buffer_spreads_over_pages() {
        let handle = RecordingHandle::new();
        let first = usable_page(0, 8, &handle);
        let second = usable_page(1, 8, &handle);
        let first = PageGuard::acquire(first).unwrap().unwrap();
        let second = PageGuard::acquire(second).unwrap().unwrap();

        let data: Vec<u8> = (1..=12).collect();
        let mut source = &data[..];
        assert_eq!(first.put_from_buffer(4, &mut source), 4);
        assert_eq!(source.len(), 8);
        assert_eq!(second.put_from_buffer(0, &mut source), 8);
        assert!(source.is_empty());

        assert_eq!(first.get(7), 4);
        assert_eq!(second.get(0), 5);
        assert_eq!(first.modified_region(), Some((4, 8)));
    }

    #[test]
    fn test_dirty_notifications_and_flush_idempotence() {
        let handle = RecordingHandle::new();
        let page = usable_page(2, PAGE_SIZE, &handle);
        let guard = PageGuard::acquire(page.clone()).unwrap().unwrap();

        guard.put_from_array(10, &[1, 2]);
        guard.put_from_array(40, &[3]);
        assert_eq!(handle.dirtied.load(Ordering::SeqCst), 1, "one clean->dirty edge");
        assert_eq!(
            *handle.regions.lock(),
            vec![(2 * PAGE_SIZE as u64 + 10, 2), (2 * PAGE_SIZE as u64 + 40, 1)]
        );
        assert_eq!(page.modified_region(), Some((10, 41)));

        page.flush().unwrap();
        page.flush().unwrap();
        assert!(page.try_flush().unwrap());
        assert_eq!(handle.flush_count(), 1);
        assert_eq!(handle.cleaned.load(Ordering::SeqCst), 1);
        let (offset, bytes) = handle.flushes.lock()[0].clone();
        assert_eq!(offset, 2 * PAGE_SIZE as u64 + 10);
        assert_eq!(bytes.len(), 31);
        assert_eq!(&bytes[..2], &[1, 2]);
        assert_eq!(bytes[30], 3);

        guard.put(0, 9);
        assert_eq!(handle.dirtied.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failed_flush_keeps_page_dirty() {
        let handle = RecordingHandle::new();
        let page = usable_page(0, PAGE_SIZE, &handle);
        PageGuard::acquire(page.clone()).unwrap().unwrap().put(5, 1);

        handle.fail_flushes.store(true, Ordering::SeqCst);
        assert!(page.flush().is_err());
        assert_eq!(page.modified_region(), Some((5, 6)));

        handle.fail_flushes.store(false, Ordering::SeqCst);
        page.flush().unwrap();
        assert!(!page.is_dirty());
    }

    #[test]
    fn test_try_flush_gives_up_on_contended_lock() {
        let handle = RecordingHandle::new();
        let page = usable_page(0, PAGE_SIZE, &handle);
        PageGuard::acquire(page.clone()).unwrap().unwrap().put(0, 1);

        let write = page.content_lock().write();
        assert!(!page.try_flush().unwrap());
        drop(write);
        assert!(page.try_flush().unwrap());
        assert!(!page.is_dirty());
    }

    #[test]
    fn test_tokens_saturate_and_decay() {
        let handle = RecordingHandle::new();
        let page = new_page(0, PAGE_SIZE, &handle);
        assert_eq!(page.tokens_of_usefulness(), 16);
        assert_eq!(page.decay_tokens(7, 8), 14);
        assert_eq!(page.add_tokens(u32::MAX), u32::MAX);
        assert_eq!(page.decay_tokens(1, 2), u32::MAX / 2);

        page.set_local_tokens(3);
        assert_eq!(page.local_tokens(), 3);
    }

    #[test]
    fn test_concurrent_users_and_reclaimer() {
        let handle = RecordingHandle::new();
        let page = usable_page(0, PAGE_SIZE, &handle);
        let done = AtomicBool::new(false);

        std::thread::scope(|scope| {
            for worker in 0..4u8 {
                let page = &page;
                scope.spawn(move || loop {
                    match PageGuard::acquire(page.clone()) {
                        Ok(Some(guard)) => {
                            guard.put(worker as usize, worker);
                            assert_eq!(guard.get(worker as usize), worker);
                        }
                        Ok(None) => unreachable!("page was loaded before"),
                        Err(CacheError::PageUnavailable { .. }) => break,
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                    std::thread::sleep(std::time::Duration::from_micros(50));
                });
            }

            // observer: no backward transitions, usage only in accessible states
            {
                let page = &page;
                let done = &done;
                scope.spawn(move || {
                    let mut last = PageState::Usable;
                    while !done.load(Ordering::Acquire) {
                        let (state, usage) = page.state_and_usage();
                        assert!(state >= last, "{state:?} after {last:?}");
                        if !state.allows_access() {
                            assert_eq!(usage, 0);
                        }
                        last = state;
                    }
                });
            }

            std::thread::sleep(std::time::Duration::from_millis(20));
            while !page.try_move_towards_pre_tombstone(false) {
                std::thread::yield_now();
            }
            page.flush().unwrap();
            page.detach_tombstone_buffer().unwrap();
            page.entomb();
            done.store(true, Ordering::Release);
        });

        assert!(page.is_tombstone());
        assert_eq!(page.usage_count(), 0);
        assert!(handle.cleaned.load(Ordering::SeqCst) <= handle.dirtied.load(Ordering::SeqCst));
    }

    #[test]
    fn test_prepare_races_acquire_and_young_entomb() {
        let handle = RecordingHandle::new();

        for round in 0..100u32 {
            let page = Arc::new(new_page(round, PAGE_SIZE, &handle));
            let loads = AtomicUsize::new(0);
            let loaded_by_prepare = AtomicUsize::new(0);
            let done = AtomicBool::new(false);
            let loader = |page: &Page| -> Result<PageBuffer> {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(PageBuffer::heap(page.page_size()))
            };

            let buffer = std::thread::scope(|scope| {
                for _ in 0..2 {
                    let (page, loader, loaded_by_prepare) = (&page, &loader, &loaded_by_prepare);
                    scope.spawn(move || {
                        std::thread::yield_now();
                        if page.try_prepare_for_use(loader).unwrap() {
                            loaded_by_prepare.fetch_add(1, Ordering::SeqCst);
                        }
                    });
                }
                for _ in 0..2 {
                    let page = &page;
                    scope.spawn(move || loop {
                        match PageGuard::acquire(page.clone()) {
                            Ok(Some(guard)) => assert_eq!(guard.get(0), 0),
                            Ok(None) => std::thread::yield_now(),
                            Err(CacheError::PageUnavailable { .. }) => break,
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    });
                }
                {
                    let (page, done) = (&page, &done);
                    scope.spawn(move || {
                        let mut last = PageState::NotReadyYet;
                        while !done.load(Ordering::Acquire) {
                            let state = page.state();
                            assert!(state >= last, "{state:?} after {last:?}");
                            last = state;
                        }
                    });
                }

                while !page.try_move_towards_pre_tombstone(true) {
                    std::thread::yield_now();
                }
                let buffer = page.detach_tombstone_buffer();
                page.entomb();
                done.store(true, Ordering::Release);
                buffer
            });

            let loads = loads.load(Ordering::SeqCst);
            assert!(loads <= 1, "round {round}: loaded {loads} times");
            assert_eq!(loaded_by_prepare.load(Ordering::SeqCst), loads);
            assert_eq!(buffer.is_some(), loads == 1);
            assert!(page.is_tombstone());
            assert_eq!(page.usage_count(), 0);
        }
    }

    proptest! {
        #[test]
        fn flush_writes_back_union_of_modified_regions(
            writes in proptest::collection::vec((0usize..200, 1usize..56), 1..20)
        ) {
            let handle = RecordingHandle::new();
            let page = usable_page(1, PAGE_SIZE, &handle);
            let guard = PageGuard::acquire(page.clone()).unwrap().unwrap();

            let mut expected = vec![0u8; PAGE_SIZE as usize];
            for (i, &(start, length)) in writes.iter().enumerate() {
                let bytes = vec![i as u8 + 1; length];
                guard.put_from_array(start, &bytes);
                expected[start..start + length].copy_from_slice(&bytes);
            }
            let min = writes.iter().map(|&(s, _)| s).min().unwrap();
            let max = writes.iter().map(|&(s, l)| s + l).max().unwrap();
            prop_assert_eq!(page.modified_region(), Some((min, max)));

            page.flush().unwrap();
            page.flush().unwrap();
            let flushes = handle.flushes.lock().clone();
            prop_assert_eq!(flushes.len(), 1);
            prop_assert_eq!(flushes[0].0, PAGE_SIZE as u64 + min as u64);
            prop_assert_eq!(&flushes[0].1[..], &expected[min..max]);
            prop_assert_eq!(handle.dirtied.load(Ordering::SeqCst), 1);
            prop_assert_eq!(handle.cleaned.load(Ordering::SeqCst), 1);
        }
    }
}
