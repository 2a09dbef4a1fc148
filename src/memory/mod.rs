mod buffer;
mod manager;
mod native;

pub use buffer::PageBuffer;
pub use manager::{MemoryManager, MemoryUsage};
pub use native::NativeBuffer;
