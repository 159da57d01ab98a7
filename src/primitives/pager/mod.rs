#![forbid(unsafe_code)]

mod freelist;
mod meta;
mod pager;

pub use freelist::{Allocator, Extent, FreeCache, FreeList};
pub use meta::{load_meta, Meta, FIRST_DATA_PAGE, META_SLOTS};
pub use pager::{Pager, PagerOptions, PagerStats, PendingCommit, Snapshot};

pub(crate) use meta::write_both_slots;
