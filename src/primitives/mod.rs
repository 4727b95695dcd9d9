//! Low-level primitives the pager is built from.
//!
//! Includes positioned file I/O, advisory file locks, and the page cache
//! with its rollback journal.

/// Advisory whole-file locks.
///
/// Shared/exclusive locking with non-blocking acquisition on top of the
/// platform's file-locking calls.
pub mod concurrency;

/// I/O abstractions and utilities.
///
/// Positioned reads and writes, file creation modes and the [`io::LockFile`] handle.
pub mod io;

/// Page cache, rollback journal and the transaction state machine.
pub mod pager;
