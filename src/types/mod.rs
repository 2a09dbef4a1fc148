mod types;

pub use types::{CacheConfig, CacheError, LockingStrategyKind, Result};
