#![forbid(unsafe_code)]

//! Shared identifiers, result codes and the crate error type.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// CRC framing for journal records.
pub mod checksum;

pub use checksum::journal_crc32;

/// Default size of one database page in bytes.
pub const DEFAULT_PAGE_SIZE: u32 = 1024;
/// Smallest page size accepted by [`crate::primitives::pager::PagerOptions`].
pub const MIN_PAGE_SIZE: u32 = 512;
/// Largest page size accepted by [`crate::primitives::pager::PagerOptions`].
pub const MAX_PAGE_SIZE: u32 = 65536;

/// A 1-based logical page number. Page 0 is never valid.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageNo(pub u32);

impl PageNo {
    /// Returns true for page numbers that may address a page.
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Byte offset of this page inside the database file.
    pub fn offset(self, page_size: usize) -> u64 {
        u64::from(self.0.saturating_sub(1)) * page_size as u64
    }
}

impl fmt::Display for PageNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PageNo {
    fn from(value: u32) -> Self {
        PageNo(value)
    }
}

impl From<PageNo> for u32 {
    fn from(value: PageNo) -> Self {
        value.0
    }
}

/// Numeric result codes reported to layers built on top of the pager.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ErrorCode {
    /// Successful result.
    Ok = 0,
    /// Generic error or missing database.
    Error,
    /// Internal logic error.
    Internal,
    /// Access permission denied.
    Perm,
    /// Callback requested an abort.
    Abort,
    /// The database file is locked by someone else.
    Busy,
    /// A table in the database is locked.
    Locked,
    /// A memory allocation failed.
    NoMem,
    /// Attempt to write a read-only database.
    ReadOnly,
    /// Operation interrupted.
    Interrupt,
    /// Some kind of disk I/O error occurred.
    IoErr,
    /// The database disk image is malformed.
    Corrupt,
    /// Requested item not found.
    NotFound,
    /// Insertion failed because the disk is full.
    Full,
    /// Unable to open the database file.
    CantOpen,
    /// Database lock protocol error.
    Protocol,
    /// Database is empty.
    Empty,
    /// Schema changed.
    Schema,
    /// Too much data for one row.
    TooBig,
    /// Constraint violation.
    Constraint,
    /// Data type mismatch.
    Mismatch,
    /// Library used incorrectly.
    Misuse,
}

impl ErrorCode {
    /// Returns the stable numeric value of the code.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Short lowercase name of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Ok => "ok",
            ErrorCode::Error => "error",
            ErrorCode::Internal => "internal",
            ErrorCode::Perm => "perm",
            ErrorCode::Abort => "abort",
            ErrorCode::Busy => "busy",
            ErrorCode::Locked => "locked",
            ErrorCode::NoMem => "nomem",
            ErrorCode::ReadOnly => "readonly",
            ErrorCode::Interrupt => "interrupt",
            ErrorCode::IoErr => "ioerr",
            ErrorCode::Corrupt => "corrupt",
            ErrorCode::NotFound => "notfound",
            ErrorCode::Full => "full",
            ErrorCode::CantOpen => "cantopen",
            ErrorCode::Protocol => "protocol",
            ErrorCode::Empty => "empty",
            ErrorCode::Schema => "schema",
            ErrorCode::TooBig => "toobig",
            ErrorCode::Constraint => "constraint",
            ErrorCode::Mismatch => "mismatch",
            ErrorCode::Misuse => "misuse",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the file layer and the pager.
#[derive(thiserror::Error, Debug)]
pub enum PagerError {
    /// The file could not be opened at all.
    #[error("cannot open {}: {source}", path.display())]
    CannotOpen {
        /// Path that failed to open.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// Lock contention. Always retryable by the caller.
    #[error("database is locked")]
    Busy,
    /// Short read or failed seek/sync/truncate/stat/close.
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    /// A write stored fewer bytes than supplied.
    #[error("disk full: wrote {written} of {expected} bytes")]
    Full {
        /// Bytes accepted by the OS.
        written: usize,
        /// Bytes supplied by the caller.
        expected: usize,
    },
    /// Journal or database structure is not what the pager wrote.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// An allocation failed.
    #[error("out of memory")]
    NoMem,
    /// Invalid lock-state transition.
    #[error("lock protocol violation: {0}")]
    Protocol(&'static str),
    /// Malformed call, e.g. page number zero.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Write attempted on a database that was opened read-only.
    #[error("attempt to write a readonly database")]
    ReadOnly,
}

impl PagerError {
    /// Maps the error onto its result code.
    pub fn code(&self) -> ErrorCode {
        match self {
            PagerError::CannotOpen { .. } => ErrorCode::CantOpen,
            PagerError::Busy => ErrorCode::Busy,
            PagerError::Io(_) => ErrorCode::IoErr,
            PagerError::Full { .. } => ErrorCode::Full,
            PagerError::Corruption(_) => ErrorCode::Corrupt,
            PagerError::NoMem => ErrorCode::NoMem,
            PagerError::Protocol(_) => ErrorCode::Protocol,
            PagerError::Invalid(_) => ErrorCode::Misuse,
            PagerError::ReadOnly => ErrorCode::ReadOnly,
        }
    }

    /// True when the caller may simply try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PagerError::Busy)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PagerError>;
