use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::backend::StorageBackend;

const DEFAULT_SEGMENT_SIZE: usize = 64 * 1024;

/// Segmented in-memory storage backend
/// Sparse: segments are allocated on first write, unwritten ranges read as zeros.
/// Suitable for tests, benchmarks, and purely in-memory stores.
pub struct MemoryBackend {
    /// Map of segment index to segment bytes
    segments: RwLock<HashMap<u64, Box<[u8]>>>,

    segment_size: usize,

    /// End of the highest byte ever written
    len: AtomicU64,

    reads: AtomicUsize,
    writes: AtomicUsize,
    bytes_written: AtomicU64,

    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryBackend {
    /// Create a new, empty backend
    pub fn new() -> Self {
        Self::with_segment_size(DEFAULT_SEGMENT_SIZE)
    }

    pub fn with_segment_size(segment_size: usize) -> Self {
        assert!(segment_size > 0, "segment_size must be > 0");
        Self {
            segments: RwLock::new(HashMap::new()),
            segment_size,
            len: AtomicU64::new(0),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            bytes_written: AtomicU64::new(0),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Backend pre-filled with `data` at offset 0
    pub fn with_content(data: &[u8]) -> Self {
        let backend = Self::new();
        backend.store(0, data);
        backend
    }

    /// Total bytes addressable (end of the highest write)
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of `len` bytes starting at `offset`, bypassing counters and failures
    pub fn snapshot(&self, offset: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.copy_out(offset, &mut out);
        out
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Make every following read fail with an I/O error
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Release);
    }

    /// Make every following write fail with an I/O error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    fn store(&self, offset: u64, data: &[u8]) {
        let mut segments = self.segments.write();
        let mut written = 0usize;
        while written < data.len() {
            let position = offset + written as u64;
            let segment_index = position / self.segment_size as u64;
            let in_segment = (position % self.segment_size as u64) as usize;
            let chunk = (self.segment_size - in_segment).min(data.len() - written);

            let segment = segments
                .entry(segment_index)
                .or_insert_with(|| vec![0u8; self.segment_size].into_boxed_slice());
            segment[in_segment..in_segment + chunk]
                .copy_from_slice(&data[written..written + chunk]);
            written += chunk;
        }
        self.len
            .fetch_max(offset + data.len() as u64, Ordering::AcqRel);
    }

    fn copy_out(&self, offset: u64, buf: &mut [u8]) {
        let segments = self.segments.read();
        let mut copied = 0usize;
        while copied < buf.len() {
            let position = offset + copied as u64;
            let segment_index = position / self.segment_size as u64;
            let in_segment = (position % self.segment_size as u64) as usize;
            let chunk = (self.segment_size - in_segment).min(buf.len() - copied);

            match segments.get(&segment_index) {
                Some(segment) => buf[copied..copied + chunk]
                    .copy_from_slice(&segment[in_segment..in_segment + chunk]),
                None => buf[copied..copied + chunk].fill(0),
            }
            copied += chunk;
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for MemoryBackend {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if self.fail_reads.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected read failure"));
        }
        self.reads.fetch_add(1, Ordering::Relaxed);

        let len = self.len();
        if offset >= len {
            return Ok(0);
        }
        let available = ((len - offset) as usize).min(buf.len());
        self.copy_out(offset, &mut buf[..available]);
        Ok(available)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        self.store(offset, data);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("segment_count", &self.segments.read().len())
            .field("len", &self.len())
            .finish()
    }
}
