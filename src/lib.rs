//! Page cache and transaction layer for a single-file database.
//!
//! A [`Pager`] maps fixed-size pages of one database file into memory,
//! hands them out as reference-counted [`PageHandle`]s, and makes batches
//! of page changes atomic through a rollback journal kept next to the
//! database (`<db>-journal`). Cross-process coordination uses advisory
//! shared/exclusive file locks; contention surfaces as
//! [`PagerError::Busy`] and the caller decides whether to retry.
//!
//! ```no_run
//! use pagekeep::{PageNo, Pager, PagerOptions};
//!
//! # fn main() -> pagekeep::Result<()> {
//! let pager = Pager::open("app.db", PagerOptions::default())?;
//! let page = pager.fetch(PageNo(1))?;
//! page.write()?[..5].copy_from_slice(b"hello");
//! pager.commit()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod primitives;
pub mod types;

pub use primitives::io::LockFile;
pub use primitives::pager::{
    ErrorMask, LockState, PageHandle, Pager, PagerOptions, PagerStats, Synchronous,
};
pub use types::{ErrorCode, PageNo, PagerError, Result};
