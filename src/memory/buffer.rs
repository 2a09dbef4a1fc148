use std::ops::{Deref, DerefMut};

use super::native::NativeBuffer;

/// Backing memory of a loaded page
///
/// Native buffers count against the native budget and are pooled for reuse;
/// heap buffers are borrowed from the heap budget once the native one is
/// exhausted and are simply dropped on release.
#[derive(Debug)]
pub enum PageBuffer {
    Native(NativeBuffer),
    Heap(Box<[u8]>),
}

impl PageBuffer {
    /// Heap buffer of `len` zero bytes, outside of any budget
    ///
    /// Useful for loaders and tests that manage memory themselves.
    pub fn heap(len: usize) -> Self {
        PageBuffer::Heap(vec![0u8; len].into_boxed_slice())
    }

    pub fn is_native(&self) -> bool {
        matches!(self, PageBuffer::Native(_))
    }
}

impl Deref for PageBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            PageBuffer::Native(buffer) => &**buffer,
            PageBuffer::Heap(buffer) => &**buffer,
        }
    }
}

impl DerefMut for PageBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self {
            PageBuffer::Native(buffer) => &mut **buffer,
            PageBuffer::Heap(buffer) => &mut **buffer,
        }
    }
}
