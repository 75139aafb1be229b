#![allow(unsafe_code)]

use std::fs::File;
use std::io;

use parking_lot::{Condvar, Mutex};

use crate::types::{Result, StoreError};

/// Staged transaction locks shared by every transaction of one open file.
///
/// - `Shared`: held by each read transaction; new holders wait while a
///   commit holds `Pending` or `Exclusive`.
/// - `Reserved`: at most one write transaction at a time.
/// - `Pending`: taken by the committing writer; blocks new readers without
///   waiting for existing ones.
/// - `Exclusive`: waits until no reader is active.
#[derive(Default)]
pub struct TxLocks {
    state: Mutex<LockState>,
    changed: Condvar,
}

#[derive(Default, Debug)]
struct LockState {
    shared: u32,
    reserved: bool,
    pending: bool,
    exclusive: bool,
}

/// Snapshot of lock state for observability.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSnapshot {
    /// Number of active readers.
    pub shared: u32,
    /// Whether a writer holds the reserved lock.
    pub reserved: bool,
    /// Whether a commit is in progress.
    pub pending: bool,
    /// Whether the in-memory state swap is in progress.
    pub exclusive: bool,
}

/// Guard representing a held shared (reader) lock.
pub struct SharedGuard<'a> {
    locks: &'a TxLocks,
}

/// Guard representing the single writer slot.
pub struct ReservedGuard<'a> {
    locks: &'a TxLocks,
}

/// Guard blocking new readers during a commit.
pub struct PendingGuard<'a> {
    locks: &'a TxLocks,
}

/// Guard held while no reader is active.
pub struct ExclusiveGuard<'a> {
    locks: &'a TxLocks,
}

impl TxLocks {
    /// Creates an idle lock monitor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires a shared lock, waiting while a commit blocks new readers.
    pub fn shared(&self) -> SharedGuard<'_> {
        let mut state = self.state.lock();
        while state.pending || state.exclusive {
            self.changed.wait(&mut state);
        }
        state.shared += 1;
        SharedGuard { locks: self }
    }

    /// Acquires the writer slot, waiting for the current writer to finish.
    pub fn reserved(&self) -> ReservedGuard<'_> {
        let mut state = self.state.lock();
        while state.reserved {
            self.changed.wait(&mut state);
        }
        state.reserved = true;
        ReservedGuard { locks: self }
    }

    /// Marks a commit as in progress. Only the reserved holder calls this, so
    /// it never has to wait.
    pub fn pending(&self, _writer: &ReservedGuard<'_>) -> PendingGuard<'_> {
        let mut state = self.state.lock();
        debug_assert!(!state.pending, "pending lock acquired twice");
        state.pending = true;
        PendingGuard { locks: self }
    }

    /// Waits for every active reader to finish and takes the exclusive lock.
    pub fn exclusive(&self, _pending: &PendingGuard<'_>) -> ExclusiveGuard<'_> {
        let mut state = self.state.lock();
        while state.shared > 0 || state.exclusive {
            self.changed.wait(&mut state);
        }
        state.exclusive = true;
        ExclusiveGuard { locks: self }
    }

    /// Returns a snapshot of the current lock state.
    pub fn snapshot(&self) -> LockSnapshot {
        let state = self.state.lock();
        LockSnapshot {
            shared: state.shared,
            reserved: state.reserved,
            pending: state.pending,
            exclusive: state.exclusive,
        }
    }

    fn release(&self, f: impl FnOnce(&mut LockState)) {
        let mut state = self.state.lock();
        f(&mut state);
        drop(state);
        self.changed.notify_all();
    }
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        self.locks
            .release(|state| state.shared = state.shared.saturating_sub(1));
    }
}

impl Drop for ReservedGuard<'_> {
    fn drop(&mut self) {
        self.locks.release(|state| state.reserved = false);
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.locks.release(|state| state.pending = false);
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.locks.release(|state| state.exclusive = false);
    }
}

/// Advisory OS lock keeping other processes from opening the same file in a
/// conflicting mode. Read-write opens take an exclusive lock, read-only opens
/// a shared one. The lock is released when the guard is dropped.
pub struct ProcessLock {
    file: File,
}

const LOCK_RANGE_START: u64 = 0;
const LOCK_RANGE_LEN: u64 = 1;

impl ProcessLock {
    /// Tries to lock `file` without blocking.
    ///
    /// Returns [`StoreError::Locked`] if another process holds a conflicting lock.
    pub fn try_acquire(file: &File, exclusive: bool) -> Result<Self> {
        let file = file.try_clone().map_err(StoreError::from)?;
        let acquired = lock_range_inner(&file, LOCK_RANGE_START, LOCK_RANGE_LEN, exclusive)
            .map_err(StoreError::from)?;
        if !acquired {
            return Err(StoreError::Locked);
        }
        Ok(Self { file })
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if let Err(err) = unlock_range(&self.file, LOCK_RANGE_START, LOCK_RANGE_LEN) {
            tracing::warn!(error = %err, "process_lock.unlock_failed");
        }
    }
}

fn lock_range_inner(file: &File, start: u64, len: u64, exclusive: bool) -> io::Result<bool> {
    #[cfg(unix)]
    {
        unix::lock_region(file, start, len, exclusive)
    }
    #[cfg(windows)]
    {
        windows::lock_region(file, start, len, exclusive)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (file, start, len, exclusive);
        Ok(true)
    }
}

fn unlock_range(file: &File, start: u64, len: u64) -> io::Result<()> {
    #[cfg(unix)]
    {
        unix::unlock_region(file, start, len)
    }
    #[cfg(windows)]
    {
        windows::unlock_region(file, start, len)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (file, start, len);
        Ok(())
    }
}

#[cfg(unix)]
mod unix {
    use super::*;
    use std::os::unix::io::AsRawFd;

    pub fn lock_region(file: &File, start: u64, len: u64, exclusive: bool) -> io::Result<bool> {
        let fd = file.as_raw_fd();
        let mut flock = libc::flock {
            l_type: if exclusive {
                libc::F_WRLCK as _
            } else {
                libc::F_RDLCK as _
            },
            l_whence: libc::SEEK_SET as _,
            l_start: start as libc::off_t,
            l_len: len as libc::off_t,
            l_pid: 0,
        };
        loop {
            let res = unsafe { libc::fcntl(fd, libc::F_SETLK, &mut flock) };
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

    pub fn unlock_region(file: &File, start: u64, len: u64) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let mut flock = libc::flock {
            l_type: libc::F_UNLCK as _,
            l_whence: libc::SEEK_SET as _,
            l_start: start as libc::off_t,
            l_len: len as libc::off_t,
            l_pid: 0,
        };
        let res = unsafe { libc::fcntl(fd, libc::F_SETLK, &mut flock) };
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::*;
    use std::mem::zeroed;
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::ERROR_LOCK_VIOLATION;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, UnlockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    pub fn lock_region(file: &File, start: u64, len: u64, exclusive: bool) -> io::Result<bool> {
        unsafe {
            let handle = file.as_raw_handle();
            let mut overlapped: OVERLAPPED = zeroed();
            overlapped.Anonymous.Anonymous.Offset = start as u32;
            overlapped.Anonymous.Anonymous.OffsetHigh = (start >> 32) as u32;
            let mut flags = LOCKFILE_FAIL_IMMEDIATELY;
            if exclusive {
                flags |= LOCKFILE_EXCLUSIVE_LOCK;
            }
            let low = len as u32;
            let high = (len >> 32) as u32;
            let res = LockFileEx(handle as isize, flags, 0, low, high, &mut overlapped);
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

    pub fn unlock_region(file: &File, start: u64, len: u64) -> io::Result<()> {
        unsafe {
            let handle = file.as_raw_handle();
            let mut overlapped: OVERLAPPED = zeroed();
            overlapped.Anonymous.Anonymous.Offset = start as u32;
            overlapped.Anonymous.Anonymous.OffsetHigh = (start >> 32) as u32;
            let low = len as u32;
            let high = (len >> 32) as u32;
            let res = UnlockFileEx(handle as isize, 0, low, high, &mut overlapped);
            if res != 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }
    }
}
