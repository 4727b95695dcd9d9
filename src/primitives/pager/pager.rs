use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use super::cache::PageCache;
use super::frame::{PgHdr, SlotId};
use super::journal::{self, journal_path, Journal};
use crate::primitives::io::{delete_file, file_exists, ExclusiveOptions, LockFile};
use crate::types::{PageNo, PagerError, Result, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE};

/// Configuration options for the pager.
///
/// Paths and limits are passed explicitly; nothing is read from the
/// environment.
#[derive(Clone, Debug)]
pub struct PagerOptions {
    /// Size of each page in bytes. Power of two in 512..=65536.
    pub page_size: u32,
    /// Cache size target. Idle pages are evicted once this many are cached.
    pub cache_pages: usize,
    /// Bytes of caller-owned scratch space attached to every cached page.
    pub extra_bytes: usize,
    /// Durability mode for commits.
    pub synchronous: Synchronous,
    /// Open the database without requesting write access.
    pub read_only: bool,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_pages: 100,
            extra_bytes: 0,
            synchronous: Synchronous::Full,
            read_only: false,
        }
    }
}

impl PagerOptions {
    /// Rejects option combinations the pager cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(PagerError::Invalid(
                "page_size must be a power of two between 512 and 65536",
            ));
        }
        if self.cache_pages == 0 {
            return Err(PagerError::Invalid("cache_pages must be at least 1"));
        }
        Ok(())
    }
}

/// Durability mode for commits.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum Synchronous {
    /// Sync the journal before any page reaches the database, including
    /// dirty pages evicted mid-transaction, and sync the database before the
    /// journal is deleted.
    #[default]
    Full,
    /// Like `Full` at commit and rollback. Dirty pages evicted before commit
    /// are written without syncing the journal first, so a power loss during
    /// such a transaction can leave pages the journal cannot restore.
    Normal,
    /// No explicit syncs. Only process crashes are survived.
    Off,
}

impl Synchronous {
    /// Returns the string representation of the synchronous mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Synchronous::Full => "full",
            Synchronous::Normal => "normal",
            Synchronous::Off => "off",
        }
    }
}

impl FromStr for Synchronous {
    type Err = PagerError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "full" => Ok(Synchronous::Full),
            "normal" => Ok(Synchronous::Normal),
            "off" => Ok(Synchronous::Off),
            _ => Err(PagerError::Invalid("unknown synchronous mode")),
        }
    }
}

/// Lock held by the pager on the database file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockState {
    /// No lock; the cache is empty.
    Unlocked,
    /// Shared lock; pages may be read.
    ReadLocked,
    /// Exclusive lock with an open rollback journal.
    WriteLocked,
}

/// Sticky set of fatal conditions.
///
/// Bits accumulate and are never cleared for the lifetime of a pager.
#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub struct ErrorMask(u8);

impl ErrorMask {
    /// A write ran out of space.
    pub const FULL: ErrorMask = ErrorMask(0x01);
    /// An allocation failed.
    pub const NO_MEM: ErrorMask = ErrorMask(0x02);
    /// The file lock could not be changed as required.
    pub const PROTOCOL: ErrorMask = ErrorMask(0x04);
    /// The journal could not be played back.
    pub const CORRUPT: ErrorMask = ErrorMask(0x08);
    /// A disk read, write or sync failed.
    pub const DISK_IO: ErrorMask = ErrorMask(0x10);

    /// Empty mask.
    pub const fn empty() -> Self {
        ErrorMask(0)
    }

    /// True when no bit is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Raw bit representation.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// True when every bit of `other` is set.
    pub const fn contains(self, other: ErrorMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets the bits of `other`.
    pub fn insert(&mut self, other: ErrorMask) {
        self.0 |= other.0;
    }

    /// True when page reads must be refused. A full disk alone still allows reads.
    pub const fn blocks_reads(self) -> bool {
        self.0 & !Self::FULL.0 != 0
    }

    /// The bit an error escalates into. `Busy` and caller mistakes map to nothing.
    pub fn from_error(err: &PagerError) -> Self {
        match err {
            PagerError::Full { .. } => Self::FULL,
            PagerError::NoMem => Self::NO_MEM,
            PagerError::Protocol(_) => Self::PROTOCOL,
            PagerError::Corruption(_) => Self::CORRUPT,
            PagerError::Io(_) | PagerError::CannotOpen { .. } => Self::DISK_IO,
            PagerError::Busy | PagerError::Invalid(_) | PagerError::ReadOnly => Self::empty(),
        }
    }

    /// Error for the highest-priority bit set:
    /// protocol > disk I/O > full > out of memory > corruption.
    pub fn to_error(self) -> Option<PagerError> {
        if self.contains(Self::PROTOCOL) {
            Some(PagerError::Protocol("pager lock state is unreliable"))
        } else if self.contains(Self::DISK_IO) {
            Some(PagerError::Io(io::Error::new(
                io::ErrorKind::Other,
                "earlier disk I/O failure",
            )))
        } else if self.contains(Self::FULL) {
            Some(PagerError::Full {
                written: 0,
                expected: 0,
            })
        } else if self.contains(Self::NO_MEM) {
            Some(PagerError::NoMem)
        } else if self.contains(Self::CORRUPT) {
            Some(PagerError::Corruption("earlier journal playback failure"))
        } else {
            None
        }
    }
}

impl fmt::Debug for ErrorMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::FULL, "FULL"),
            (Self::NO_MEM, "NO_MEM"),
            (Self::PROTOCOL, "PROTOCOL"),
            (Self::CORRUPT, "CORRUPT"),
            (Self::DISK_IO, "DISK_IO"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "ErrorMask({})", set.join("|"))
    }
}

/// Statistics tracking pager operations.
#[derive(Default, Clone, Debug)]
pub struct PagerStats {
    /// Fetches served from the cache.
    pub hits: u64,
    /// Fetches that had to load a page.
    pub misses: u64,
    /// Pages read from the database file.
    pub disk_reads: u64,
    /// Idle pages evicted under cache pressure.
    pub evictions: u64,
    /// Dirty pages written back before eviction.
    pub dirty_writebacks: u64,
    /// Completed commits.
    pub commits: u64,
    /// Completed rollbacks.
    pub rollbacks: u64,
    /// Whole-cache discards after the last reference was released.
    pub cache_resets: u64,
    /// Journals left by a crashed writer and played back.
    pub hot_journal_recoveries: u64,
    /// fsync calls on the journal or the database file.
    pub syncs: u64,
}

impl fmt::Display for PagerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} evictions={} dirty_writebacks={} commits={} rollbacks={} syncs={}",
            self.hits,
            self.misses,
            self.evictions,
            self.dirty_writebacks,
            self.commits,
            self.rollbacks,
            self.syncs
        )
    }
}

/// Callback run with a page's bytes when it goes idle or is evicted.
///
/// It runs while the pager is locked and must not call back into the pager.
pub type PageDestructor = Box<dyn Fn(PageNo, &[u8]) + Send + Sync>;

struct PagerInner {
    db: Option<LockFile>,
    state: LockState,
    cache: PageCache,
    db_size: Option<u32>,
    errors: ErrorMask,
    journal: Option<Journal>,
    checkpoint: Option<Journal>,
    needs_sync: bool,
    stats: PagerStats,
}

fn closed() -> PagerError {
    PagerError::Protocol("pager is closed")
}

fn temp_path(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{prefix}{:016x}", rand::random::<u64>()))
}

/// Page cache over one database file with locking and a rollback journal.
///
/// - Pages are handed out as [`PageHandle`] guards; dropping the last guard
///   for a page puts it on the free list.
/// - Dropping the last guard of the whole cache discards every cached page
///   and releases the file lock, rolling back an uncommitted transaction.
/// - Lock contention is reported as [`PagerError::Busy`] and never waited on.
///
/// Outside Linux, file locks do not separate pagers in the same process.
/// Open at most one `Pager` per database file per process there. A second
/// one would see the first one's live journal as hot and play it back.
pub struct Pager {
    path: PathBuf,
    journal_path: PathBuf,
    options: PagerOptions,
    page_size: usize,
    read_only: bool,
    temp: bool,
    destructor: Option<PageDestructor>,
    inner: Mutex<PagerInner>,
}

impl Pager {
    /// Opens (creating if needed) the database at `path`.
    ///
    /// If write access is refused the database is opened read-only.
    pub fn open(path: impl AsRef<Path>, options: PagerOptions) -> Result<Self> {
        options.validate()?;
        let path = path.as_ref();
        let (db, read_only) = if options.read_only {
            (LockFile::open_read_only(path)?, true)
        } else {
            LockFile::open(path)?
        };
        info!(
            path = %path.display(),
            read_only,
            page_size = options.page_size,
            cache_pages = options.cache_pages,
            "pager.open"
        );
        Ok(Self::from_parts(path, db, read_only, false, options))
    }

    /// Opens an anonymous database in the system temp directory.
    ///
    /// The file is unlinked right after creation and vanishes on close.
    pub fn open_temp(options: PagerOptions) -> Result<Self> {
        options.validate()?;
        let path = temp_path("pagekeep_");
        let db = LockFile::open_exclusive(
            &path,
            ExclusiveOptions {
                unlink_after_open: true,
                ..ExclusiveOptions::default()
            },
        )?;
        debug!(path = %path.display(), "pager.open_temp");
        Ok(Self::from_parts(&path, db, false, true, options))
    }

    fn from_parts(
        path: &Path,
        db: LockFile,
        read_only: bool,
        temp: bool,
        options: PagerOptions,
    ) -> Self {
        Self {
            path: path.to_path_buf(),
            journal_path: journal_path(path),
            page_size: options.page_size as usize,
            options,
            read_only,
            temp,
            destructor: None,
            inner: Mutex::new(PagerInner {
                db: Some(db),
                state: LockState::Unlocked,
                cache: PageCache::new(),
                db_size: None,
                errors: ErrorMask::empty(),
                journal: None,
                checkpoint: None,
                needs_sync: false,
                stats: PagerStats::default(),
            }),
        }
    }

    /// Registers the callback run when a page goes idle or is evicted.
    pub fn set_destructor<F>(&mut self, destructor: F)
    where
        F: Fn(PageNo, &[u8]) + Send + Sync + 'static,
    {
        self.destructor = Some(Box::new(destructor));
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the rollback journal.
    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// True when the database was opened without write access.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// True for databases created by [`Pager::open_temp`].
    pub fn is_temp(&self) -> bool {
        self.temp
    }

    /// Current lock state.
    pub fn lock_state(&self) -> LockState {
        self.inner.lock().state
    }

    /// Number of cached pages.
    pub fn cached_pages(&self) -> usize {
        self.inner.lock().cache.len()
    }

    /// Number of cached pages with at least one reference.
    pub fn outstanding_refs(&self) -> usize {
        self.inner.lock().cache.outstanding()
    }

    /// Reference count of a resident page.
    pub fn ref_count(&self, page_no: PageNo) -> Option<u32> {
        let inner = self.inner.lock();
        inner
            .cache
            .find(page_no)
            .map(|slot| inner.cache.hdr(slot).ref_count)
    }

    /// Idle pages in eviction order, oldest first.
    pub fn idle_pages(&self) -> Vec<PageNo> {
        self.inner.lock().cache.idle_pages()
    }

    /// Sticky error bits recorded so far.
    pub fn error_mask(&self) -> ErrorMask {
        self.inner.lock().errors
    }

    /// Snapshot of the operation counters.
    pub fn stats(&self) -> PagerStats {
        self.inner.lock().stats.clone()
    }

    /// Returns a guarded reference to page `page_no`, loading it on a miss.
    ///
    /// The first fetch while unlocked takes the shared lock. Pages past the
    /// end of the file read as zeros.
    pub fn fetch(&self, page_no: PageNo) -> Result<PageHandle<'_>> {
        if !page_no.is_valid() {
            return Err(PagerError::Invalid("page number 0"));
        }
        let mut inner = self.inner.lock();
        if inner.errors.blocks_reads() {
            if let Some(err) = inner.errors.to_error() {
                return Err(err);
            }
        }
        if inner.state == LockState::Unlocked {
            debug_assert_eq!(inner.cache.outstanding(), 0);
            self.acquire_read_lock(&mut inner)?;
        }
        let slot = match inner.cache.find(page_no) {
            Some(slot) => {
                inner.cache.pin(slot);
                inner.stats.hits += 1;
                slot
            }
            None => match self.load_page(&mut inner, page_no) {
                Ok(slot) => slot,
                Err(err) => {
                    if inner.cache.outstanding() == 0 {
                        self.reset_cache(&mut inner);
                    }
                    return Err(err);
                }
            },
        };
        Ok(self.handle(&inner, slot))
    }

    /// Returns a guarded reference to `page_no` only if it is already cached.
    ///
    /// Never reads the disk or changes the lock. Page 0 and an idle pager
    /// yield `None`.
    pub fn lookup(&self, page_no: PageNo) -> Result<Option<PageHandle<'_>>> {
        if !page_no.is_valid() {
            return Ok(None);
        }
        let mut inner = self.inner.lock();
        if inner.errors.blocks_reads() {
            if let Some(err) = inner.errors.to_error() {
                return Err(err);
            }
        }
        if inner.cache.outstanding() == 0 {
            return Ok(None);
        }
        let Some(slot) = inner.cache.find(page_no) else {
            return Ok(None);
        };
        inner.cache.pin(slot);
        inner.stats.hits += 1;
        Ok(Some(self.handle(&inner, slot)))
    }

    /// Releases a page reference. Same as dropping the handle.
    pub fn release(&self, page: PageHandle<'_>) {
        debug_assert!(std::ptr::eq(page.pager, self), "handle from another pager");
        drop(page);
    }

    /// Number of pages in the database.
    ///
    /// The value is cached only while a lock is held; an unlocked pager
    /// re-reads the file size every time.
    pub fn page_count(&self) -> Result<u32> {
        let mut inner = self.inner.lock();
        self.page_count_locked(&mut inner)
    }

    /// Starts a write transaction: exclusive lock plus a fresh journal.
    ///
    /// Requires a read lock, i.e. at least one page reference held.
    pub fn begin_write(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.begin_write_locked(&mut inner)
    }

    /// Makes the current write transaction durable and drops back to a shared lock.
    pub fn commit(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != LockState::WriteLocked {
            return Err(PagerError::Protocol("commit without a write transaction"));
        }
        if let Some(err) = inner.errors.to_error() {
            if inner.errors == ErrorMask::FULL {
                self.rollback_locked(&mut inner)?;
            }
            return Err(err);
        }
        match self.commit_locked(&mut inner) {
            Ok(()) => Ok(()),
            Err(err) => {
                inner.errors.insert(ErrorMask::from_error(&err));
                warn!(error = %err, "pager.commit.failed");
                if let Err(rollback_err) = self.rollback_locked(&mut inner) {
                    warn!(error = %rollback_err, "pager.commit.rollback_failed");
                }
                Err(err)
            }
        }
    }

    /// Undoes the current write transaction and drops back to a shared lock.
    ///
    /// A no-op without a write transaction. Callers must not hold page data
    /// guards across this call.
    pub fn rollback(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != LockState::WriteLocked {
            return Ok(());
        }
        self.rollback_locked(&mut inner)
    }

    /// Opens a checkpoint inside the current write transaction.
    ///
    /// Changes made after this point can be undone by
    /// [`Pager::checkpoint_rollback`] without abandoning the transaction.
    pub fn checkpoint_begin(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != LockState::WriteLocked {
            return Err(PagerError::Protocol(
                "checkpoint requires a write transaction",
            ));
        }
        if inner.checkpoint.is_some() {
            return Ok(());
        }
        let size = self.page_count_locked(&mut inner)?;
        let covered = inner
            .journal
            .as_ref()
            .map_or(0, Journal::orig_len)
            .max(u64::from(size) * self.page_size as u64);
        let file = LockFile::open_exclusive(
            temp_path("pagekeep_ckpt_"),
            ExclusiveOptions {
                unlink_after_open: true,
                ..ExclusiveOptions::default()
            },
        )?;
        inner.checkpoint = Some(Journal::create(file, self.page_size, covered)?);
        debug!(db_size = size, "pager.checkpoint.begin");
        Ok(())
    }

    /// Keeps every change made since [`Pager::checkpoint_begin`].
    pub fn checkpoint_commit(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(ckpt) = inner.checkpoint.take() else {
            return Ok(());
        };
        for slot in inner.cache.all_slots() {
            inner.cache.hdr_mut(slot).in_checkpoint = false;
        }
        if let Err(err) = ckpt.into_file().close() {
            warn!(error = %err, "pager.checkpoint.close_failed");
        }
        debug!("pager.checkpoint.commit");
        Ok(())
    }

    /// Restores every page changed since [`Pager::checkpoint_begin`].
    pub fn checkpoint_rollback(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(ckpt) = inner.checkpoint.take() else {
            return Ok(());
        };
        let covered = ckpt.orig_len();
        let size = u32::try_from(covered / self.page_size as u64).unwrap_or(u32::MAX);
        let file = ckpt.into_file();
        let result = {
            let inner = &*inner;
            let db = inner.db.as_ref().ok_or_else(closed)?;
            let cache = &inner.cache;
            let page_size = self.page_size;
            journal::replay(&file, page_size, |page_no, image| {
                match cache.find(page_no) {
                    Some(slot) => cache.hdr(slot).data.write().copy_from_slice(image),
                    None => db.write_at(page_no.offset(page_size), image)?,
                }
                Ok(())
            })
        };
        if let Err(err) = file.close() {
            warn!(error = %err, "pager.checkpoint.close_failed");
        }
        if let Err(err) = result {
            inner.errors.insert(ErrorMask::from_error(&err));
            return Err(err);
        }
        for slot in inner.cache.all_slots() {
            let hdr = inner.cache.hdr_mut(slot);
            hdr.in_checkpoint = false;
            if hdr.page_no.offset(self.page_size) >= covered {
                hdr.data.write().fill(0);
                hdr.dirty = false;
            }
        }
        inner.db_size = Some(size);
        debug!(db_size = size, "pager.checkpoint.rollback");
        Ok(())
    }

    /// Closes the pager: rolls back an open transaction, releases the lock,
    /// discards the cache and closes the file.
    ///
    /// Teardown always completes; the first error met is returned.
    pub fn close(self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.shutdown(&mut inner)
    }

    fn shutdown(&self, inner: &mut PagerInner) -> Result<()> {
        let mut first_err = None;
        if inner.state == LockState::WriteLocked {
            if let Err(err) = self.rollback_locked(inner) {
                first_err.get_or_insert(err);
            }
        }
        inner.cache.clear();
        inner.db_size = None;
        inner.state = LockState::Unlocked;
        if let Some(db) = inner.db.take() {
            if let Err(err) = db.close() {
                warn!(path = %self.path.display(), error = %err, "pager.close.failed");
                first_err.get_or_insert(err);
            }
        }
        info!(path = %self.path.display(), "pager.close");
        first_err.map_or(Ok(()), Err)
    }

    fn handle(&self, inner: &PagerInner, slot: SlotId) -> PageHandle<'_> {
        let hdr = inner.cache.hdr(slot);
        PageHandle {
            pager: self,
            slot,
            page_no: hdr.page_no,
            data: Arc::clone(&hdr.data),
            extra: Arc::clone(&hdr.extra),
        }
    }

    fn page_count_locked(&self, inner: &mut PagerInner) -> Result<u32> {
        if let Some(size) = inner.db_size {
            return Ok(size);
        }
        let len = inner.db.as_ref().ok_or_else(closed)?.size()?;
        let count = u32::try_from(len / self.page_size as u64).unwrap_or(u32::MAX);
        if inner.state != LockState::Unlocked {
            inner.db_size = Some(count);
        }
        Ok(count)
    }

    fn acquire_read_lock(&self, inner: &mut PagerInner) -> Result<()> {
        let db = inner.db.as_ref().ok_or_else(closed)?;
        db.lock_shared()?;
        inner.state = LockState::ReadLocked;
        inner.db_size = None;
        if file_exists(&self.journal_path) {
            if let Err(err) = self.recover_hot_journal(inner) {
                inner.errors.insert(ErrorMask::from_error(&err));
                if let Some(db) = inner.db.as_ref() {
                    if let Err(unlock_err) = db.unlock() {
                        inner.errors.insert(ErrorMask::PROTOCOL);
                        warn!(error = %unlock_err, "pager.unlock.failed");
                    }
                }
                inner.state = LockState::Unlocked;
                return Err(err);
            }
        }
        debug!(path = %self.path.display(), "pager.lock.shared");
        Ok(())
    }

    fn recover_hot_journal(&self, inner: &mut PagerInner) -> Result<()> {
        let db = inner.db.as_ref().ok_or_else(closed)?;
        if self.read_only {
            return Err(PagerError::ReadOnly);
        }
        db.lock_exclusive()?;
        let (file, _) = LockFile::open(&self.journal_path)?;
        let page_size = self.page_size;
        let replayed = journal::replay(&file, page_size, |page_no, image| {
            db.write_at(page_no.offset(page_size), image)
        });
        let orig = match replayed {
            Ok(orig) => orig,
            Err(err) => {
                // Leave the journal on disk so a later open can retry.
                let _ = file.close();
                return Err(err);
            }
        };
        if let Some(len) = orig {
            db.truncate(len)?;
        }
        db.sync()?;
        inner.stats.syncs += 1;
        file.close()?;
        delete_file(&self.journal_path)?;
        db.lock_shared()?;
        inner.stats.hot_journal_recoveries += 1;
        info!(
            journal = %self.journal_path.display(),
            orig_len = ?orig,
            "pager.recover.hot_journal"
        );
        Ok(())
    }

    fn load_page(&self, inner: &mut PagerInner, page_no: PageNo) -> Result<SlotId> {
        inner.stats.misses += 1;
        if inner.cache.len() >= self.options.cache_pages {
            if let Some(victim) = inner.cache.oldest_idle() {
                self.evict(inner, victim)?;
            }
        }
        let db = inner.db.as_ref().ok_or_else(closed)?;
        let mut buf = vec![0u8; self.page_size].into_boxed_slice();
        let offset = page_no.offset(self.page_size);
        let available = db.size()?.saturating_sub(offset).min(self.page_size as u64) as usize;
        if available > 0 {
            db.read_at(offset, &mut buf[..available])?;
            inner.stats.disk_reads += 1;
        }
        let mut hdr = PgHdr::new(page_no, buf, self.options.extra_bytes);
        if let Some(journal) = inner.journal.as_ref() {
            hdr.in_journal = journal.contains(page_no);
        }
        if let Some(ckpt) = inner.checkpoint.as_ref() {
            hdr.in_checkpoint = ckpt.contains(page_no);
        }
        let slot = inner.cache.insert(hdr);
        debug!(
            page = page_no.0,
            from_disk = available > 0,
            cached = inner.cache.len(),
            "pager.fetch.miss"
        );
        Ok(slot)
    }

    fn evict(&self, inner: &mut PagerInner, victim: SlotId) -> Result<()> {
        if inner.cache.hdr(victim).dirty {
            if self.options.synchronous == Synchronous::Full {
                self.sync_journal(inner)?;
            }
            let hdr = inner.cache.hdr(victim);
            let db = inner.db.as_ref().ok_or_else(closed)?;
            let written = db.write_at(hdr.page_no.offset(self.page_size), &hdr.data.read());
            if let Err(err) = written {
                inner.errors.insert(ErrorMask::from_error(&err));
                return Err(err);
            }
            inner.stats.dirty_writebacks += 1;
        }
        let hdr = inner.cache.remove(victim);
        self.run_destructor(hdr.page_no, &hdr.data);
        inner.stats.evictions += 1;
        debug!(page = hdr.page_no.0, dirty = hdr.dirty, "pager.evict");
        Ok(())
    }

    fn sync_journal(&self, inner: &mut PagerInner) -> Result<()> {
        if !inner.needs_sync || self.options.synchronous == Synchronous::Off {
            return Ok(());
        }
        if let Some(journal) = inner.journal.as_ref() {
            if let Err(err) = journal.sync() {
                inner.errors.insert(ErrorMask::from_error(&err));
                return Err(err);
            }
            inner.stats.syncs += 1;
        }
        inner.needs_sync = false;
        Ok(())
    }

    fn begin_write_locked(&self, inner: &mut PagerInner) -> Result<()> {
        match inner.state {
            LockState::WriteLocked => return Ok(()),
            LockState::Unlocked => {
                return Err(PagerError::Protocol("begin_write requires a read lock"))
            }
            LockState::ReadLocked => {}
        }
        if self.read_only {
            return Err(PagerError::ReadOnly);
        }
        if let Some(err) = inner.errors.to_error() {
            return Err(err);
        }
        inner.db.as_ref().ok_or_else(closed)?.lock_exclusive()?;
        let opened = self.page_count_locked(inner).and_then(|_| {
            let orig_len = inner.db.as_ref().ok_or_else(closed)?.size()?;
            let file = LockFile::open_exclusive(&self.journal_path, ExclusiveOptions::default())?;
            match Journal::create(file, self.page_size, orig_len) {
                Ok(journal) => Ok(journal),
                Err(err) => {
                    let _ = delete_file(&self.journal_path);
                    Err(err)
                }
            }
        });
        match opened {
            Ok(journal) => {
                debug!(orig_len = journal.orig_len(), "pager.begin_write");
                inner.journal = Some(journal);
                inner.needs_sync = true;
                inner.state = LockState::WriteLocked;
                Ok(())
            }
            Err(err) => {
                self.downgrade(inner);
                Err(err)
            }
        }
    }

    fn downgrade(&self, inner: &mut PagerInner) {
        if let Some(db) = inner.db.as_ref() {
            if let Err(err) = db.lock_shared() {
                inner.errors.insert(ErrorMask::PROTOCOL);
                warn!(error = %err, "pager.lock.downgrade_failed");
            }
        }
        inner.state = LockState::ReadLocked;
    }

    fn make_writable(&self, slot: SlotId) -> Result<()> {
        let mut guard = self.inner.lock();
        if let Some(err) = guard.errors.to_error() {
            return Err(err);
        }
        if self.read_only {
            return Err(PagerError::ReadOnly);
        }
        self.begin_write_locked(&mut guard)?;
        let size = self.page_count_locked(&mut guard)?;
        let inner = &mut *guard;
        let hdr = inner.cache.hdr_mut(slot);
        let page_no = hdr.page_no;
        let Some(journal) = inner.journal.as_mut() else {
            return Err(PagerError::Protocol("write transaction without a journal"));
        };
        if !hdr.in_journal {
            if journal.predates(page_no) {
                let appended = journal.append(page_no, &hdr.data.read());
                if let Err(err) = appended {
                    inner.errors.insert(ErrorMask::from_error(&err));
                    return Err(err);
                }
                inner.needs_sync = true;
            } else {
                journal.mark(page_no);
            }
            hdr.in_journal = true;
        }
        if let Some(ckpt) = inner.checkpoint.as_mut() {
            if !hdr.in_checkpoint {
                if ckpt.predates(page_no) {
                    let appended = ckpt.append(page_no, &hdr.data.read());
                    if let Err(err) = appended {
                        inner.errors.insert(ErrorMask::from_error(&err));
                        return Err(err);
                    }
                } else {
                    ckpt.mark(page_no);
                }
                hdr.in_checkpoint = true;
            }
        }
        hdr.dirty = true;
        if page_no.0 > size {
            inner.db_size = Some(page_no.0);
        }
        Ok(())
    }

    fn commit_locked(&self, inner: &mut PagerInner) -> Result<()> {
        self.sync_journal(inner)?;
        let mut dirty: Vec<SlotId> = inner
            .cache
            .all_slots()
            .into_iter()
            .filter(|&slot| inner.cache.hdr(slot).dirty)
            .collect();
        dirty.sort_by_key(|&slot| inner.cache.hdr(slot).page_no);
        let size = self.page_count_locked(inner)?;
        let orig_len = inner.journal.as_ref().map_or(0, Journal::orig_len);
        let db = inner.db.as_ref().ok_or_else(closed)?;
        for &slot in &dirty {
            let hdr = inner.cache.hdr(slot);
            db.write_at(hdr.page_no.offset(self.page_size), &hdr.data.read())?;
        }
        // Only bytes added during this transaction are cut.
        let target = orig_len.max(u64::from(size) * self.page_size as u64);
        if db.size()? > target {
            db.truncate(target)?;
        }
        if self.options.synchronous != Synchronous::Off {
            db.sync()?;
            inner.stats.syncs += 1;
        }
        if let Some(ckpt) = inner.checkpoint.take() {
            if let Err(err) = ckpt.into_file().close() {
                warn!(error = %err, "pager.checkpoint.close_failed");
            }
        }
        let mut journaled = 0;
        if let Some(journal) = inner.journal.take() {
            journaled = journal.records();
            let close_result = journal.into_file().close();
            delete_file(&self.journal_path)?;
            close_result?;
        }
        for slot in inner.cache.all_slots() {
            let hdr = inner.cache.hdr_mut(slot);
            hdr.dirty = false;
            hdr.in_journal = false;
            hdr.in_checkpoint = false;
        }
        self.downgrade(inner);
        inner.stats.commits += 1;
        info!(
            pages = dirty.len(),
            journaled,
            db_size = size,
            "pager.commit.complete"
        );
        Ok(())
    }

    fn rollback_locked(&self, inner: &mut PagerInner) -> Result<()> {
        if let Some(ckpt) = inner.checkpoint.take() {
            if let Err(err) = ckpt.into_file().close() {
                warn!(error = %err, "pager.checkpoint.close_failed");
            }
        }
        let Some(journal) = inner.journal.take() else {
            self.downgrade(inner);
            return Ok(());
        };
        let orig_len = journal.orig_len();
        let orig = u32::try_from(orig_len / self.page_size as u64).unwrap_or(u32::MAX);
        let sync_db = self.options.synchronous != Synchronous::Off;
        let file = journal.into_file();
        let result = {
            let inner = &*inner;
            let db = inner.db.as_ref().ok_or_else(closed)?;
            let cache = &inner.cache;
            let page_size = self.page_size;
            journal::replay(&file, page_size, |page_no, image| {
                db.write_at(page_no.offset(page_size), image)?;
                if let Some(slot) = cache.find(page_no) {
                    cache.hdr(slot).data.write().copy_from_slice(image);
                }
                Ok(())
            })
            .and_then(|_| db.truncate(orig_len))
            .and_then(|()| if sync_db { db.sync() } else { Ok(()) })
        };
        if sync_db && result.is_ok() {
            inner.stats.syncs += 1;
        }
        let closed_file = file.close();
        for slot in inner.cache.all_slots() {
            let hdr = inner.cache.hdr_mut(slot);
            if hdr.page_no.offset(self.page_size) >= orig_len {
                hdr.data.write().fill(0);
            }
            hdr.dirty = false;
            hdr.in_journal = false;
            hdr.in_checkpoint = false;
        }
        inner.db_size = Some(orig);
        let result = result.and_then(|()| {
            closed_file?;
            delete_file(&self.journal_path)
        });
        if let Err(err) = &result {
            // The journal stays on disk; the next reader recovers from it.
            inner.errors.insert(ErrorMask::from_error(err));
            warn!(error = %err, "pager.rollback.failed");
        }
        self.downgrade(inner);
        inner.stats.rollbacks += 1;
        info!(orig_len, "pager.rollback.complete");
        result
    }

    fn reset_cache(&self, inner: &mut PagerInner) {
        if inner.state == LockState::WriteLocked {
            if let Err(err) = self.rollback_locked(inner) {
                warn!(error = %err, "pager.reset.rollback_failed");
            }
        }
        let discarded = inner.cache.len();
        inner.cache.clear();
        if let Some(db) = inner.db.as_ref() {
            if let Err(err) = db.unlock() {
                inner.errors.insert(ErrorMask::PROTOCOL);
                warn!(error = %err, "pager.unlock.failed");
            }
        }
        inner.state = LockState::Unlocked;
        inner.db_size = None;
        inner.stats.cache_resets += 1;
        debug!(discarded, "pager.reset");
    }

    fn run_destructor(&self, page_no: PageNo, data: &RwLock<Box<[u8]>>) {
        if let Some(destructor) = self.destructor.as_ref() {
            destructor(page_no, &data.read());
        }
    }

    fn pin(&self, slot: SlotId) {
        self.inner.lock().cache.pin(slot);
    }

    fn release_slot(&self, slot: SlotId) {
        let mut inner = self.inner.lock();
        if !inner.cache.unpin(slot) {
            return;
        }
        let hdr = inner.cache.hdr(slot);
        self.run_destructor(hdr.page_no, &hdr.data);
        if inner.cache.outstanding() == 0 {
            self.reset_cache(&mut inner);
        }
    }

    fn slot_flag<F: Fn(&PgHdr) -> bool>(&self, slot: SlotId, f: F) -> bool {
        f(self.inner.lock().cache.hdr(slot))
    }
}

impl Drop for Pager {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        if inner.db.is_none() {
            return;
        }
        if let Err(err) = self.shutdown(&mut inner) {
            warn!(error = %err, "pager.drop.shutdown_failed");
        }
    }
}

impl fmt::Debug for Pager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Pager")
            .field("path", &self.path)
            .field("state", &inner.state)
            .field("cached", &inner.cache.len())
            .field("outstanding", &inner.cache.outstanding())
            .field("errors", &inner.errors)
            .finish()
    }
}

/// A referenced page. The reference is released when the handle drops.
pub struct PageHandle<'a> {
    pager: &'a Pager,
    slot: SlotId,
    page_no: PageNo,
    data: Arc<RwLock<Box<[u8]>>>,
    extra: Arc<Mutex<Box<[u8]>>>,
}

impl PageHandle<'_> {
    /// Page number of this page.
    pub fn page_no(&self) -> PageNo {
        self.page_no
    }

    /// Read access to the page bytes.
    pub fn data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }

    /// Write access to the page bytes.
    ///
    /// Starts a write transaction if none is open and journals the page's
    /// current content before the first change. Do not hold another guard
    /// on this page while calling.
    pub fn write(&self) -> Result<RwLockWriteGuard<'_, Box<[u8]>>> {
        self.pager.make_writable(self.slot)?;
        Ok(self.data.write())
    }

    /// Caller-owned scratch bytes attached to the page.
    pub fn extra(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.extra.lock()
    }

    /// True when the page has uncommitted changes.
    pub fn is_dirty(&self) -> bool {
        self.pager.slot_flag(self.slot, |hdr| hdr.dirty)
    }

    /// True when the page's pre-image is covered by the rollback journal.
    pub fn in_journal(&self) -> bool {
        self.pager.slot_flag(self.slot, |hdr| hdr.in_journal)
    }
}

impl Clone for PageHandle<'_> {
    fn clone(&self) -> Self {
        self.pager.pin(self.slot);
        Self {
            pager: self.pager,
            slot: self.slot,
            page_no: self.page_no,
            data: Arc::clone(&self.data),
            extra: Arc::clone(&self.extra),
        }
    }
}

impl Drop for PageHandle<'_> {
    fn drop(&mut self) {
        self.pager.release_slot(self.slot);
    }
}

impl fmt::Debug for PageHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageHandle")
            .field("page_no", &self.page_no)
            .finish()
    }
}
