//! Boundary between the cache and whatever actually stores page bytes.

pub mod memory;

pub use memory::MemoryBackend;

use std::io;

use crate::memory::PageBuffer;
use crate::page::Page;
use crate::types::Result;

/// Byte-addressable backing store of one paged file
pub trait StorageBackend: Send + Sync {
    /// Read up to `buf.len()` bytes starting at `offset`
    ///
    /// Returns the number of bytes read; a short count means end of data.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `data` starting at `offset`
    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Make previous writes durable
    fn sync(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Notifications a page sends to the storage that owns it
pub trait PageStorageHandle: Send + Sync {
    /// Page went from clean to dirty
    fn page_become_dirty(&self);

    /// Page went from dirty to clean (its modifications were flushed)
    fn page_become_clean(&self);

    /// Region `[start_offset_in_file, start_offset_in_file + length)` was modified
    fn modified_region_updated(&self, start_offset_in_file: u64, length: usize);

    /// Write `data` to the file at `offset_in_file`
    fn flush_bytes(&self, data: &[u8], offset_in_file: u64) -> io::Result<()>;
}

/// Produces the content of a page about to become usable
///
/// Invoked exactly once per NOT_READY_YET -> LOADING transition, by the
/// thread that won it.
pub trait PageContentLoader {
    fn load_page_content(&self, page: &Page) -> Result<PageBuffer>;
}

impl<F> PageContentLoader for F
where
    F: Fn(&Page) -> Result<PageBuffer>,
{
    fn load_page_content(&self, page: &Page) -> Result<PageBuffer> {
        self(page)
    }
}
