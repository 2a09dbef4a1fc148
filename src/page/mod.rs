mod page;
mod state;
mod table;

#[cfg(test)]
pub(crate) mod testing;

pub use page::{Page, PageGuard, TokenPolicy};
pub use state::{PageState, MAX_USAGE_COUNT};
pub use table::{identity_hash, mix_hash, PageIndexHash, PagesTable, MIN_TABLE_SIZE};
