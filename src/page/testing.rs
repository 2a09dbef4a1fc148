//! Storage handle that records what pages report to it.

use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::backend::PageStorageHandle;
use crate::locking::{LockPerPage, PageContentLockingStrategy};
use crate::memory::PageBuffer;
use crate::page::{Page, TokenPolicy};
use crate::types::Result;

#[derive(Debug, Default)]
pub(crate) struct RecordingHandle {
    pub dirtied: AtomicUsize,
    pub cleaned: AtomicUsize,
    pub regions: Mutex<Vec<(u64, usize)>>,
    pub flushes: Mutex<Vec<(u64, Vec<u8>)>>,
    pub fail_flushes: AtomicBool,
}

impl RecordingHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.lock().len()
    }
}

impl PageStorageHandle for RecordingHandle {
    fn page_become_dirty(&self) {
        self.dirtied.fetch_add(1, Ordering::SeqCst);
    }

    fn page_become_clean(&self) {
        self.cleaned.fetch_add(1, Ordering::SeqCst);
    }

    fn modified_region_updated(&self, start_offset_in_file: u64, length: usize) {
        self.regions.lock().push((start_offset_in_file, length));
    }

    fn flush_bytes(&self, data: &[u8], offset_in_file: u64) -> io::Result<()> {
        if self.fail_flushes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "flush refused"));
        }
        self.flushes.lock().push((offset_in_file, data.to_vec()));
        Ok(())
    }
}

/// Fresh NOT_READY_YET page with its own lock
pub(crate) fn new_page(index: u32, page_size: u32, handle: &Arc<RecordingHandle>) -> Page {
    Page::not_ready(
        index,
        page_size,
        handle.clone(),
        LockPerPage.lock_for_page(index),
        TokenPolicy::default(),
    )
}

/// Page already loaded with zeros, USABLE and not acquired
pub(crate) fn usable_page(index: u32, page_size: u32, handle: &Arc<RecordingHandle>) -> Arc<Page> {
    let page = Arc::new(new_page(index, page_size, handle));
    let loaded = page
        .try_prepare_for_use(&|page: &Page| -> Result<PageBuffer> {
            Ok(PageBuffer::heap(page.page_size()))
        })
        .unwrap();
    assert!(loaded);
    page
}
