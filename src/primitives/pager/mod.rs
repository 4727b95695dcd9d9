#![forbid(unsafe_code)]

mod cache;
mod frame;
mod journal;
mod pager;

pub use cache::PAGE_HASH_BUCKETS;
pub use journal::{journal_path, JOURNAL_HEADER_LEN, JOURNAL_MAGIC};
pub use pager::{
    ErrorMask, LockState, PageDestructor, PageHandle, Pager, PagerOptions, PagerStats,
    Synchronous,
};
