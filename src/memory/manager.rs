use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::buffer::PageBuffer;
use super::native::NativeBuffer;

/// Snapshot of the memory budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage {
    pub native_used: u64,
    pub heap_used: u64,
    pub native_capacity: u64,
    pub heap_capacity: u64,
}

impl MemoryUsage {
    pub fn total_used(&self) -> u64 {
        self.native_used + self.heap_used
    }
}

/// Bounds and tracks the bytes held by page buffers
///
/// Bytes are reserved from a budget with a CAS before memory is actually
/// allocated, so a failed allocation rolls back cleanly and usage is never
/// counted twice. Counters are never guarded by a lock: budget queries stay
/// available while other threads are stuck in slow flushes.
pub struct MemoryManager {
    native_capacity: u64,
    heap_capacity: u64,

    native_used: AtomicU64,
    heap_used: AtomicU64,

    /// Released native buffers by size, ready for reuse
    pool: Mutex<HashMap<usize, Vec<NativeBuffer>>>,
    max_pooled_per_size: usize,
}

impl MemoryManager {
    pub fn new(native_capacity: u64, heap_capacity: u64, max_pooled_per_size: usize) -> Self {
        Self {
            native_capacity,
            heap_capacity,
            native_used: AtomicU64::new(0),
            heap_used: AtomicU64::new(0),
            pool: Mutex::new(HashMap::new()),
            max_pooled_per_size,
        }
    }

    /// Try to allocate a zero-filled buffer of `size` bytes
    ///
    /// Takes the native budget first. If it is exhausted and
    /// `allow_above_capacity` is set, borrows from the heap budget instead
    /// (never from both). `None` means both budgets refused: back off,
    /// reclaim something, and retry.
    pub fn try_allocate(&self, size: usize, allow_above_capacity: bool) -> Option<PageBuffer> {
        let bytes = size as u64;

        if Self::try_reserve(&self.native_used, self.native_capacity, bytes) {
            match self.take_pooled(size).or_else(|| NativeBuffer::allocate(size)) {
                Some(buffer) => return Some(PageBuffer::Native(buffer)),
                None => {
                    // OS refused the mapping: give the reservation back and try heap
                    Self::unreserve(&self.native_used, bytes);
                }
            }
        }

        if allow_above_capacity && Self::try_reserve(&self.heap_used, self.heap_capacity, bytes) {
            return Some(PageBuffer::heap(size));
        }

        None
    }

    /// Return a buffer obtained from [`try_allocate`](Self::try_allocate)
    pub fn release_buffer(&self, buffer: PageBuffer) {
        match buffer {
            PageBuffer::Native(native) => {
                Self::unreserve(&self.native_used, native.len() as u64);
                let mut pool = self.pool.lock();
                let pooled = pool.entry(native.len()).or_default();
                if pooled.len() < self.max_pooled_per_size {
                    pooled.push(native);
                }
            }
            PageBuffer::Heap(heap) => {
                Self::unreserve(&self.heap_used, heap.len() as u64);
            }
        }
    }

    /// True if total usage exceeds the native capacity, i.e. heap is borrowed
    pub fn has_overflow(&self) -> bool {
        self.native_used() + self.heap_used() > self.native_capacity
    }

    pub fn native_used(&self) -> u64 {
        self.native_used.load(Ordering::Acquire)
    }

    pub fn heap_used(&self) -> u64 {
        self.heap_used.load(Ordering::Acquire)
    }

    pub fn native_capacity(&self) -> u64 {
        self.native_capacity
    }

    pub fn heap_capacity(&self) -> u64 {
        self.heap_capacity
    }

    pub fn usage(&self) -> MemoryUsage {
        MemoryUsage {
            native_used: self.native_used(),
            heap_used: self.heap_used(),
            native_capacity: self.native_capacity,
            heap_capacity: self.heap_capacity,
        }
    }

    /// Number of native buffers parked in the reuse pool
    pub fn pooled_buffers(&self) -> usize {
        self.pool.lock().values().map(Vec::len).sum()
    }

    fn take_pooled(&self, size: usize) -> Option<NativeBuffer> {
        let mut buffer = self.pool.lock().get_mut(&size)?.pop()?;
        buffer.fill(0);
        Some(buffer)
    }

    fn try_reserve(counter: &AtomicU64, capacity: u64, bytes: u64) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&total| total <= capacity)
            })
            .is_ok()
    }

    fn unreserve(counter: &AtomicU64, bytes: u64) {
        if let Err(used) = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
            used.checked_sub(bytes)
        }) {
            panic!("Bug: releasing {bytes} bytes but only {used} are accounted -- buffer released twice?");
        }
    }
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("native_used", &self.native_used())
            .field("native_capacity", &self.native_capacity)
            .field("heap_used", &self.heap_used())
            .field("heap_capacity", &self.heap_capacity)
            .field("pooled_buffers", &self.pooled_buffers())
            .finish()
    }
}
