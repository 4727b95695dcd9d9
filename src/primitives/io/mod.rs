#![forbid(unsafe_code)]

use std::{
    fs::{self, File, OpenOptions},
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};

use parking_lot::Mutex;
use tracing::debug;

use crate::primitives::concurrency::{close_file, FileLock, LockLevel};
use crate::types::{PagerError, Result};

/// Positioned file I/O that reports how many bytes actually moved.
///
/// Implementations must not loop to fill short transfers; the exact-length
/// checks live in [`read_exact_at`] and [`write_all_at`].
pub trait FileIo: Send + Sync {
    /// Reads into `dst` at `off`, returning the number of bytes read.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> io::Result<usize>;
    /// Writes `src` at `off`, returning the number of bytes written.
    fn write_at(&self, off: u64, src: &[u8]) -> io::Result<usize>;
    /// Synchronizes file data and metadata to disk.
    fn sync_all(&self) -> io::Result<()>;
    /// Returns the current length of the file in bytes.
    fn len(&self) -> io::Result<u64>;
    /// Returns true if the file is empty.
    fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends the file to `len` bytes.
    fn truncate(&self, len: u64) -> io::Result<()>;
}

impl FileIo for File {
    #[cfg(unix)]
    fn read_at(&self, off: u64, dst: &mut [u8]) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, dst, off)
    }

    #[cfg(windows)]
    fn read_at(&self, off: u64, dst: &mut [u8]) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(self, dst, off)
    }

    #[cfg(unix)]
    fn write_at(&self, off: u64, src: &[u8]) -> io::Result<usize> {
        std::os::unix::fs::FileExt::write_at(self, src, off)
    }

    #[cfg(windows)]
    fn write_at(&self, off: u64, src: &[u8]) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_write(self, src, off)
    }

    #[cfg(not(any(unix, windows)))]
    fn read_at(&self, _off: u64, _dst: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(
            ErrorKind::Unsupported,
            "positioned reads unsupported on this platform",
        ))
    }

    #[cfg(not(any(unix, windows)))]
    fn write_at(&self, _off: u64, _src: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(
            ErrorKind::Unsupported,
            "positioned writes unsupported on this platform",
        ))
    }

    fn sync_all(&self) -> io::Result<()> {
        File::sync_all(self)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Reads exactly `dst.len()` bytes at `off`.
///
/// A read that returns fewer bytes than requested is an I/O error; there is
/// no partial-read tolerance at this layer.
pub fn read_exact_at<F: FileIo + ?Sized>(io: &F, off: u64, dst: &mut [u8]) -> Result<()> {
    let read = loop {
        match io.read_at(off, dst) {
            Ok(n) => break n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(PagerError::Io(err)),
        }
    };
    if read < dst.len() {
        return Err(PagerError::Io(io::Error::new(
            ErrorKind::UnexpectedEof,
            format!("short read: {read} of {} bytes at offset {off}", dst.len()),
        )));
    }
    Ok(())
}

/// Writes all of `src` at `off`.
///
/// A write that stores fewer bytes than supplied, or fails because the
/// device is out of space, is reported as [`PagerError::Full`].
pub fn write_all_at<F: FileIo + ?Sized>(io: &F, off: u64, src: &[u8]) -> Result<()> {
    let written = loop {
        match io.write_at(off, src) {
            Ok(n) => break n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if is_disk_full(&err) => {
                return Err(PagerError::Full {
                    written: 0,
                    expected: src.len(),
                })
            }
            Err(err) => return Err(PagerError::Io(err)),
        }
    };
    if written < src.len() {
        return Err(PagerError::Full {
            written,
            expected: src.len(),
        });
    }
    Ok(())
}

fn is_disk_full(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::ENOSPC)
    }
    #[cfg(windows)]
    {
        // ERROR_HANDLE_DISK_FULL, ERROR_DISK_FULL
        matches!(err.raw_os_error(), Some(39) | Some(112))
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = err;
        false
    }
}

/// Returns true if `path` names an existing file or directory.
pub fn file_exists(path: impl AsRef<Path>) -> bool {
    fs::metadata(path).is_ok()
}

/// Removes the file at `path`.
pub fn delete_file(path: impl AsRef<Path>) -> Result<()> {
    fs::remove_file(path).map_err(PagerError::from)
}

/// Flags for [`LockFile::open_exclusive`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ExclusiveOptions {
    /// Remove the directory entry right after opening, leaving an anonymous
    /// file that disappears when the handle closes.
    pub unlink_after_open: bool,
    /// Open even when the path already exists, truncating it.
    pub replace_existing: bool,
}

/// One open file with positioned I/O and advisory whole-file locking.
///
/// The database file and the journal files are both `LockFile`s.
///
/// On Linux the locks are open-file-description locks, so two `LockFile`s on
/// the same path contend even within one process. Other Unix systems only
/// offer per-process `fcntl` locks, and there locking excludes other
/// processes only.
pub struct LockFile {
    file: File,
    path: PathBuf,
    read_only: bool,
    lock: FileLock,
    cursor: Mutex<u64>,
}

impl LockFile {
    fn from_file(file: File, path: &Path, read_only: bool) -> Self {
        Self {
            file,
            path: path.to_path_buf(),
            read_only,
            lock: FileLock::new(),
            cursor: Mutex::new(0),
        }
    }

    /// Opens `path` read-write, creating it if absent.
    ///
    /// When read-write access is refused the file is reopened read-only; the
    /// returned flag reports which mode was obtained.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, bool)> {
        let path = path.as_ref();
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
        {
            Ok(file) => Ok((Self::from_file(file, path, false), false)),
            Err(rw_err) => {
                debug!(path = %path.display(), error = %rw_err, "io.open.read_only_fallback");
                let file = File::open(path).map_err(|source| PagerError::CannotOpen {
                    path: path.to_path_buf(),
                    source,
                })?;
                Ok((Self::from_file(file, path, true), true))
            }
        }
    }

    /// Opens an existing file read-only.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| PagerError::CannotOpen {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_file(file, path, true))
    }

    /// Creates `path` for exclusive use.
    ///
    /// Fails with [`PagerError::CannotOpen`] when the path already exists
    /// unless `options.replace_existing` is set. Symlinks are never followed
    /// on Unix.
    pub fn open_exclusive(path: impl AsRef<Path>, options: ExclusiveOptions) -> Result<Self> {
        let path = path.as_ref();
        let mut open = OpenOptions::new();
        open.read(true).write(true);
        if options.replace_existing {
            open.create(true).truncate(true);
        } else {
            open.create_new(true);
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            open.mode(0o600).custom_flags(libc::O_NOFOLLOW);
        }
        let file = open.open(path).map_err(|source| PagerError::CannotOpen {
            path: path.to_path_buf(),
            source,
        })?;
        if options.unlink_after_open {
            fs::remove_file(path).map_err(PagerError::from)?;
        }
        Ok(Self::from_file(file, path, false))
    }

    /// Path the file was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when the handle was opened without write access.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Reads exactly `dst.len()` bytes at `off`.
    pub fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        read_exact_at(&self.file, off, dst)
    }

    /// Writes all of `src` at `off`.
    pub fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        write_all_at(&self.file, off, src)
    }

    /// Moves the cursor used by [`LockFile::read`] and [`LockFile::write`].
    pub fn seek(&self, off: u64) -> Result<()> {
        *self.cursor.lock() = off;
        Ok(())
    }

    /// Reads `len` bytes at the cursor and advances it.
    pub fn read(&self, len: usize) -> Result<Vec<u8>> {
        let mut cursor = self.cursor.lock();
        let mut buf = vec![0u8; len];
        self.read_at(*cursor, &mut buf)?;
        *cursor += len as u64;
        Ok(buf)
    }

    /// Writes `src` at the cursor and advances it.
    pub fn write(&self, src: &[u8]) -> Result<()> {
        let mut cursor = self.cursor.lock();
        self.write_at(*cursor, src)?;
        *cursor += src.len() as u64;
        Ok(())
    }

    /// Truncates or extends the file to `len` bytes.
    pub fn truncate(&self, len: u64) -> Result<()> {
        FileIo::truncate(&self.file, len).map_err(PagerError::from)
    }

    /// Flushes file data and metadata to stable storage.
    pub fn sync(&self) -> Result<()> {
        FileIo::sync_all(&self.file).map_err(PagerError::from)
    }

    /// Current file length in bytes.
    pub fn size(&self) -> Result<u64> {
        FileIo::len(&self.file).map_err(PagerError::from)
    }

    /// Releases any lock and closes the descriptor, reporting close errors.
    pub fn close(self) -> Result<()> {
        let unlocked = self.lock.unlock(&self.file);
        let closed = close_file(self.file).map_err(PagerError::from);
        unlocked.and(closed)
    }

    /// Takes (or downgrades to) a shared lock without blocking.
    pub fn lock_shared(&self) -> Result<()> {
        self.lock.lock_shared(&self.file)
    }

    /// Takes (or upgrades to) an exclusive lock without blocking.
    pub fn lock_exclusive(&self) -> Result<()> {
        self.lock.lock_exclusive(&self.file)
    }

    /// Drops any held lock; succeeds when none is held.
    pub fn unlock(&self) -> Result<()> {
        self.lock.unlock(&self.file)
    }

    /// Level of the lock this handle holds.
    pub fn lock_level(&self) -> LockLevel {
        self.lock.level()
    }
}
