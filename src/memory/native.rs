use std::ops::{Deref, DerefMut};

/// Page buffer allocated outside the Rust heap with mmap (VirtualAlloc on Windows)
///
/// The memory is zero-filled by the OS on allocation and unmapped on drop.
pub struct NativeBuffer {
    /// Base pointer to mmap'd region
    base_ptr: *mut u8,

    /// Length of the mapping in bytes
    len: usize,
}

impl NativeBuffer {
    /// Map a fresh zero-filled region of `len` bytes
    ///
    /// Returns `None` if the OS refuses the mapping.
    pub fn allocate(len: usize) -> Option<Self> {
        if len == 0 {
            return None;
        }
        let base_ptr = Self::mmap_anonymous(len)?;
        Some(Self { base_ptr, len })
    }

    /// Reserve memory using mmap
    #[cfg(unix)]
    fn mmap_anonymous(size: usize) -> Option<*mut u8> {
        use libc::{mmap, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};

        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == MAP_FAILED {
            return None;
        }

        Some(ptr as *mut u8)
    }

    #[cfg(windows)]
    fn mmap_anonymous(size: usize) -> Option<*mut u8> {
        use winapi::um::memoryapi::VirtualAlloc;
        use winapi::um::winnt::{MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};

        let ptr = unsafe {
            VirtualAlloc(
                std::ptr::null_mut(),
                size,
                MEM_RESERVE | MEM_COMMIT,
                PAGE_READWRITE,
            )
        };

        if ptr.is_null() {
            return None;
        }

        Some(ptr as *mut u8)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for NativeBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the mapping is `len` bytes, readable, and lives as long as self
        unsafe { std::slice::from_raw_parts(self.base_ptr, self.len) }
    }
}

impl DerefMut for NativeBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusive access
        unsafe { std::slice::from_raw_parts_mut(self.base_ptr, self.len) }
    }
}

impl Drop for NativeBuffer {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.base_ptr as *mut libc::c_void, self.len);
        }

        #[cfg(windows)]
        unsafe {
            use winapi::um::memoryapi::VirtualFree;
            use winapi::um::winnt::MEM_RELEASE;
            VirtualFree(self.base_ptr as *mut winapi::ctypes::c_void, 0, MEM_RELEASE);
        }
    }
}

// Thread safety: the buffer exclusively owns its mapping
unsafe impl Send for NativeBuffer {}
unsafe impl Sync for NativeBuffer {}

impl std::fmt::Debug for NativeBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeBuffer")
            .field("base_ptr", &self.base_ptr)
            .field("len", &self.len)
            .finish()
    }
}
