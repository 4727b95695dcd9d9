#![allow(unsafe_code)]

use std::fs::File;
use std::io;

use crate::types::{PagerError, Result};
use parking_lot::Mutex;

/// Level of the advisory lock a handle currently holds on its file.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum LockLevel {
    /// No lock held.
    #[default]
    None,
    /// Shared (read) lock over the whole file.
    Shared,
    /// Exclusive (write) lock over the whole file.
    Exclusive,
}

/// Non-blocking whole-file advisory lock bound to one open file.
///
/// The recorded level and the system lock call run under one mutex so two
/// threads sharing a handle cannot interleave "check state, then lock".
/// A contended acquire never waits; it reports [`PagerError::Busy`].
#[derive(Debug, Default)]
pub struct FileLock {
    level: Mutex<LockLevel>,
}

impl FileLock {
    /// Creates a lock tracker that holds nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the level currently held.
    pub fn level(&self) -> LockLevel {
        *self.level.lock()
    }

    /// Takes a shared lock, downgrading an exclusive one if held.
    pub fn lock_shared(&self, file: &File) -> Result<()> {
        let mut level = self.level.lock();
        if *level == LockLevel::Shared {
            return Ok(());
        }
        if !sys::try_lock(file, false, *level).map_err(PagerError::from)? {
            return Err(PagerError::Busy);
        }
        *level = LockLevel::Shared;
        Ok(())
    }

    /// Takes an exclusive lock, upgrading a shared one if held.
    ///
    /// On contention the previous level is kept and `Busy` is returned.
    pub fn lock_exclusive(&self, file: &File) -> Result<()> {
        let mut level = self.level.lock();
        if *level == LockLevel::Exclusive {
            return Ok(());
        }
        if !sys::try_lock(file, true, *level).map_err(PagerError::from)? {
            return Err(PagerError::Busy);
        }
        *level = LockLevel::Exclusive;
        Ok(())
    }

    /// Drops whatever lock is held. A no-op when nothing is held.
    pub fn unlock(&self, file: &File) -> Result<()> {
        let mut level = self.level.lock();
        if *level == LockLevel::None {
            return Ok(());
        }
        sys::unlock(file).map_err(PagerError::from)?;
        *level = LockLevel::None;
        Ok(())
    }
}

/// Closes `file` and reports the result of the underlying close call.
pub fn close_file(file: File) -> io::Result<()> {
    sys::close(file)
}

#[cfg(unix)]
mod sys {
    use super::LockLevel;
    use std::fs::File;
    use std::io;
    use std::os::unix::io::{AsRawFd, IntoRawFd};

    // Open-file-description locks belong to the handle, not the process, so
    // two handles on one file contend even inside a single process.
    // Elsewhere F_SETLK locks belong to the process: a second handle in the
    // same process always succeeds, and closing any handle drops them all.
    #[cfg(target_os = "linux")]
    const SET_LOCK: libc::c_int = libc::F_OFD_SETLK;
    #[cfg(not(target_os = "linux"))]
    const SET_LOCK: libc::c_int = libc::F_SETLK;

    fn whole_file(kind: libc::c_int) -> libc::flock {
        let mut flock: libc::flock = unsafe { std::mem::zeroed() };
        flock.l_type = kind as _;
        flock.l_whence = libc::SEEK_SET as _;
        flock.l_start = 0;
        flock.l_len = 0;
        flock
    }

    fn set_lock(file: &File, kind: libc::c_int) -> io::Result<bool> {
        let fd = file.as_raw_fd();
        let mut flock = whole_file(kind);
        loop {
            let res = unsafe { libc::fcntl(fd, SET_LOCK, &mut flock) };
            if res == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) | Some(libc::EACCES) => return Ok(false),
                _ => return Err(err),
            }
        }
    }

    pub fn try_lock(file: &File, exclusive: bool, _held: LockLevel) -> io::Result<bool> {
        let kind = if exclusive {
            libc::F_WRLCK
        } else {
            libc::F_RDLCK
        };
        set_lock(file, kind as libc::c_int)
    }

    pub fn unlock(file: &File) -> io::Result<()> {
        if set_lock(file, libc::F_UNLCK as libc::c_int)? {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                "unlock rejected by the kernel",
            ))
        }
    }

    pub fn close(file: File) -> io::Result<()> {
        let fd = file.into_raw_fd();
        let res = unsafe { libc::close(fd) };
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(windows)]
mod sys {
    use super::LockLevel;
    use std::fs::File;
    use std::io;
    use std::mem::zeroed;
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::ERROR_LOCK_VIOLATION;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, UnlockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    fn lock_region(file: &File, exclusive: bool) -> io::Result<bool> {
        unsafe {
            let handle = file.as_raw_handle();
            let mut overlapped: OVERLAPPED = zeroed();
            let mut flags = LOCKFILE_FAIL_IMMEDIATELY;
            if exclusive {
                flags |= LOCKFILE_EXCLUSIVE_LOCK;
            }
            let res = LockFileEx(
                handle as isize,
                flags,
                0,
                u32::MAX,
                u32::MAX,
                &mut overlapped,
            );
            if res != 0 {
                Ok(true)
            } else {
                let err = io::Error::last_os_error();
                if matches!(err.raw_os_error(), Some(code) if code as u32 == ERROR_LOCK_VIOLATION)
                {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    // Windows cannot convert a held range lock in place, so a level change
    // drops the old lock first and restores it if the new one is refused.
    pub fn try_lock(file: &File, exclusive: bool, held: LockLevel) -> io::Result<bool> {
        if held != LockLevel::None {
            unlock(file)?;
        }
        if lock_region(file, exclusive)? {
            return Ok(true);
        }
        if held != LockLevel::None {
            lock_region(file, held == LockLevel::Exclusive)?;
        }
        Ok(false)
    }

    pub fn unlock(file: &File) -> io::Result<()> {
        unsafe {
            let handle = file.as_raw_handle();
            let mut overlapped: OVERLAPPED = zeroed();
            let res = UnlockFileEx(handle as isize, 0, u32::MAX, u32::MAX, &mut overlapped);
            if res != 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }
    }

    pub fn close(file: File) -> io::Result<()> {
        drop(file);
        Ok(())
    }
}

#[cfg(not(any(unix, windows)))]
mod sys {
    use super::LockLevel;
    use std::fs::File;
    use std::io;

    pub fn try_lock(_file: &File, _exclusive: bool, _held: LockLevel) -> io::Result<bool> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "file locking unsupported on this platform",
        ))
    }

    pub fn unlock(_file: &File) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "file locking unsupported on this platform",
        ))
    }

    pub fn close(file: File) -> io::Result<()> {
        drop(file);
        Ok(())
    }
}
