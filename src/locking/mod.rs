//! Assignment of page content locks.
//!
//! A page's content is guarded by a reader-writer lock handed out by a
//! [`PageContentLockingStrategy`] when the page is created. The strategy is
//! picked once per cache and never changes afterwards.
//!
//! With [`SharedLock`] many pages hold the very same lock, so a thread holding
//! one page's write lock blocks every other page. Reads are reentrant and
//! requesting a page never waits for a content lock, so a `read` closure may
//! request and read other pages. Writes are not reentrant: never start a
//! write from inside a `read` closure, and never touch the content of
//! another page from inside a `write` closure, when the pages may share a
//! lock.

use parking_lot::RwLock;
use std::fmt::Debug;
use std::sync::Arc;

use crate::types::LockingStrategyKind;

/// Lock guarding page content; carries no data of its own
pub type PageLock = Arc<RwLock<()>>;

pub trait PageContentLockingStrategy: Send + Sync + Debug {
    /// Lock to guard the content of page `page_index`
    fn lock_for_page(&self, page_index: u32) -> PageLock;
}

/// A fresh lock for every page
#[derive(Debug, Default)]
pub struct LockPerPage;

impl PageContentLockingStrategy for LockPerPage {
    fn lock_for_page(&self, _page_index: u32) -> PageLock {
        Arc::new(RwLock::new(()))
    }
}

/// One lock shared by every page
#[derive(Debug, Default)]
pub struct SharedLock {
    lock: PageLock,
}

impl SharedLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PageContentLockingStrategy for SharedLock {
    fn lock_for_page(&self, _page_index: u32) -> PageLock {
        Arc::clone(&self.lock)
    }
}

/// Build the strategy selected in the configuration
pub fn strategy_for(kind: LockingStrategyKind) -> Arc<dyn PageContentLockingStrategy> {
    match kind {
        LockingStrategyKind::PerPage => Arc::new(LockPerPage),
        LockingStrategyKind::Shared => Arc::new(SharedLock::new()),
    }
}
