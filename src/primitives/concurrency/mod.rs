#![allow(unsafe_code)]

//! Writer exclusion and reader bookkeeping.
//!
//! At most one write transaction is active per database. Inside a process
//! this is enforced with a mutex-protected flag; across processes a byte
//! range lock on the `<db>-lock` side file keeps a second writer out.
//! Readers never take the writer lock. They register the transaction id of
//! their snapshot so the pager knows which freed pages may still be visible.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::types::{ArborError, Result, TxnId};

/// Behaviour when a write transaction is requested while another is active.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum LockMode {
    /// Fail immediately with [`ArborError::LockBusy`].
    #[default]
    FailFast,
    /// Wait until the active writer finishes.
    Block,
}

/// Single-writer lock for one database file.
#[derive(Clone)]
pub struct WriterLock {
    inner: Arc<Inner>,
}

struct Inner {
    file: Option<File>,
    held: Mutex<bool>,
    released: Condvar,
}

/// Guard representing the held writer lock; dropping it releases the lock.
pub struct WriterGuard {
    inner: Arc<Inner>,
}

/// Returns the path of the side file used for cross-process writer locking.
pub fn lock_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push("-lock");
    PathBuf::from(name)
}

impl WriterLock {
    /// Opens or creates the lock file next to `db_path`.
    pub fn open(db_path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path(db_path))
            .map_err(ArborError::from)?;
        if file.metadata().map_err(ArborError::from)?.len() < WRITER_SLOT_LEN {
            file.set_len(WRITER_SLOT_LEN).map_err(ArborError::from)?;
        }
        Ok(Self::with_file(Some(file)))
    }

    /// Creates a lock that only coordinates threads of this process.
    pub fn in_process() -> Self {
        Self::with_file(None)
    }

    fn with_file(file: Option<File>) -> Self {
        Self {
            inner: Arc::new(Inner {
                file,
                held: Mutex::new(false),
                released: Condvar::new(),
            }),
        }
    }

    /// Acquires the writer lock according to `mode`.
    pub fn acquire(&self, mode: LockMode) -> Result<WriterGuard> {
        {
            let mut held = self.inner.held.lock();
            while *held {
                match mode {
                    LockMode::FailFast => return Err(ArborError::LockBusy),
                    LockMode::Block => self.inner.released.wait(&mut held),
                }
            }
            *held = true;
        }
        if let Some(file) = &self.inner.file {
            let blocking = mode == LockMode::Block;
            let locked = match lock_region(file, WRITER_SLOT_START, WRITER_SLOT_LEN, blocking) {
                Ok(locked) => locked,
                Err(err) => {
                    self.release_in_process();
                    return Err(ArborError::from(err));
                }
            };
            if !locked {
                self.release_in_process();
                return Err(ArborError::LockBusy);
            }
        }
        Ok(WriterGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Returns true when a writer currently holds the lock in this process.
    pub fn is_held(&self) -> bool {
        *self.inner.held.lock()
    }

    fn release_in_process(&self) {
        release(&self.inner);
    }
}

fn release(inner: &Inner) {
    let mut held = inner.held.lock();
    *held = false;
    inner.released.notify_one();
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        if let Some(file) = &self.inner.file {
            if let Err(err) = unlock_region(file, WRITER_SLOT_START, WRITER_SLOT_LEN) {
                debug!(error = %err, "concurrency.writer_unlock_failed");
            }
        }
        release(&self.inner);
    }
}

/// Registry of snapshot transaction ids held by active readers.
#[derive(Clone, Default)]
pub struct ReaderTable {
    inner: Arc<Mutex<BTreeMap<TxnId, usize>>>,
}

/// Registration of one reader; dropping it unregisters the reader.
pub struct ReaderSlot {
    table: Arc<Mutex<BTreeMap<TxnId, usize>>>,
    txn: TxnId,
}

impl ReaderTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a reader of the snapshot published by `txn`.
    pub fn register(&self, txn: TxnId) -> ReaderSlot {
        *self.inner.lock().entry(txn).or_insert(0) += 1;
        ReaderSlot {
            table: Arc::clone(&self.inner),
            txn,
        }
    }

    /// Oldest snapshot still being read, if any.
    pub fn oldest(&self) -> Option<TxnId> {
        self.inner.lock().keys().next().copied()
    }

    /// Number of registered readers.
    pub fn active(&self) -> usize {
        self.inner.lock().values().sum()
    }
}

impl ReaderSlot {
    /// Transaction id of the snapshot being read.
    pub fn txn(&self) -> TxnId {
        self.txn
    }
}

impl Drop for ReaderSlot {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        if let Some(count) = table.get_mut(&self.txn) {
            *count -= 1;
            if *count == 0 {
                table.remove(&self.txn);
            }
        }
    }
}

const WRITER_SLOT_START: u64 = 0;
const WRITER_SLOT_LEN: u64 = 1;

fn lock_region(file: &File, start: u64, len: u64, blocking: bool) -> io::Result<bool> {
    #[cfg(unix)]
    {
        unix::lock_region(file, start, len, blocking)
    }
    #[cfg(windows)]
    {
        windows::lock_region(file, start, len, blocking)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (file, start, len, blocking);
        Ok(true)
    }
}

fn unlock_region(file: &File, start: u64, len: u64) -> io::Result<()> {
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

    pub fn lock_region(file: &File, start: u64, len: u64, blocking: bool) -> io::Result<bool> {
        let fd = file.as_raw_fd();
        let mut flock = libc::flock {
            l_type: libc::F_WRLCK as _,
            l_whence: libc::SEEK_SET as _,
            l_start: start as libc::off_t,
            l_len: len as libc::off_t,
            l_pid: 0,
        };
        let cmd = if blocking {
            libc::F_SETLKW
        } else {
            libc::F_SETLK
        };
        loop {
            let res = unsafe { libc::fcntl(fd, cmd, &mut flock) };
            if res == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) if blocking => continue,
                Some(libc::EAGAIN) | Some(libc::EACCES) if !blocking => return Ok(false),
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

    pub fn lock_region(file: &File, start: u64, len: u64, blocking: bool) -> io::Result<bool> {
        unsafe {
            let handle = file.as_raw_handle();
            let mut overlapped: OVERLAPPED = zeroed();
            overlapped.Anonymous.Anonymous.Offset = start as u32;
            overlapped.Anonymous.Anonymous.OffsetHigh = (start >> 32) as u32;
            let mut flags = LOCKFILE_EXCLUSIVE_LOCK;
            if !blocking {
                flags |= LOCKFILE_FAIL_IMMEDIATELY;
            }
            let res = LockFileEx(
                handle as isize,
                flags,
                0,
                len as u32,
                (len >> 32) as u32,
                &mut overlapped,
            );
            if res != 0 {
                Ok(true)
            } else {
                let err = io::Error::last_os_error();
                if !blocking && matches!(err.raw_os_error(), Some(code) if code as u32 == ERROR_LOCK_VIOLATION)
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
            let res = UnlockFileEx(
                handle as isize,
                0,
                len as u32,
                (len >> 32) as u32,
                &mut overlapped,
            );
            if res != 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }
    }
}
