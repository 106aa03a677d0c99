//! Memory-mapped region and the process-shared mutex/condvar inside it.

use std::cell::UnsafeCell;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use crate::error::{Result, RingError};
use crate::layout::*;
use crate::RingMode;

/// Synchronization block at the end of the region.
#[repr(C)]
pub(crate) struct SyncBlock {
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    cond: UnsafeCell<libc::pthread_cond_t>,
    /// 0 until the writer finished initializing, then a [`RingMode`].
    mode: AtomicU8,
}

impl SyncBlock {
    /// Initialize the mutex and condvar as process-shared.
    ///
    /// # Safety
    /// Must be called exactly once, before any other process maps the region.
    unsafe fn init(&self) -> Result<()> {
        let mut cattr: libc::pthread_condattr_t = std::mem::zeroed();
        check("pthread_condattr_init", libc::pthread_condattr_init(&mut cattr))?;
        check(
            "pthread_condattr_setpshared",
            libc::pthread_condattr_setpshared(&mut cattr, libc::PTHREAD_PROCESS_SHARED),
        )?;
        check("pthread_cond_init", libc::pthread_cond_init(self.cond.get(), &cattr))?;
        libc::pthread_condattr_destroy(&mut cattr);

        let mut mattr: libc::pthread_mutexattr_t = std::mem::zeroed();
        check("pthread_mutexattr_init", libc::pthread_mutexattr_init(&mut mattr))?;
        check(
            "pthread_mutexattr_setpshared",
            libc::pthread_mutexattr_setpshared(&mut mattr, libc::PTHREAD_PROCESS_SHARED),
        )?;
        check("pthread_mutex_init", libc::pthread_mutex_init(self.mutex.get(), &mattr))?;
        libc::pthread_mutexattr_destroy(&mut mattr);
        Ok(())
    }

    pub(crate) fn lock(&self) -> Result<SharedGuard<'_>> {
        // SAFETY: the mutex was initialized by the writer before `mode` became non-zero.
        check("pthread_mutex_lock", unsafe { libc::pthread_mutex_lock(self.mutex.get()) })?;
        Ok(SharedGuard { sync: self })
    }

    pub(crate) fn try_lock(&self) -> Option<SharedGuard<'_>> {
        // SAFETY: see `lock`.
        match unsafe { libc::pthread_mutex_trylock(self.mutex.get()) } {
            0 => Some(SharedGuard { sync: self }),
            _ => None,
        }
    }

    /// Wake waiters if the mutex is free right now; skipped otherwise, waiters re-check on timeout.
    pub(crate) fn notify_if_free(&self) {
        if let Some(guard) = self.try_lock() {
            guard.notify_all();
        }
    }

    pub(crate) fn mode(&self) -> Option<RingMode> {
        RingMode::from_byte(self.mode.load(Ordering::Acquire))
    }
}

/// Held lock on the shared mutex.
pub(crate) struct SharedGuard<'a> {
    sync: &'a SyncBlock,
}

impl SharedGuard<'_> {
    /// Wait on the shared condvar for at most `timeout`.
    pub(crate) fn wait_timeout(&self, timeout: Duration) {
        // SAFETY: timespec is plain data; the mutex is held by this guard.
        unsafe {
            let mut ts: libc::timespec = std::mem::zeroed();
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
            let nanos = ts.tv_nsec as u64 + timeout.subsec_nanos() as u64;
            ts.tv_sec += timeout.as_secs() as libc::time_t + (nanos / 1_000_000_000) as libc::time_t;
            ts.tv_nsec = (nanos % 1_000_000_000) as _;
            libc::pthread_cond_timedwait(self.sync.cond.get(), self.sync.mutex.get(), &ts);
        }
    }

    pub(crate) fn notify_all(&self) {
        // SAFETY: condvar initialized with the region.
        unsafe {
            libc::pthread_cond_broadcast(self.sync.cond.get());
        }
    }
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: this guard holds the lock.
        unsafe {
            libc::pthread_mutex_unlock(self.sync.mutex.get());
        }
    }
}

fn check(op: &'static str, code: i32) -> Result<()> {
    if code != 0 {
        return Err(RingError::Sync { op, code });
    }
    Ok(())
}

/// A mapping of the whole ring file.
pub(crate) struct Region {
    ptr: NonNull<u8>,
    path: PathBuf,
}

// SAFETY: all shared state inside the region is accessed through atomics or
// the process-shared mutex; slot memory is handed over via the count bytes.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Create a fresh zero-filled region at `path`, replacing a stale file.
    ///
    /// The file is built under a temporary name and renamed into place once
    /// the sync block and mode are initialized, so a reader never maps a
    /// half-initialized region.
    pub(crate) fn create(path: &Path, mode: RingMode) -> Result<Self> {
        if path.exists() {
            tracing::warn!(path = %path.display(), "removing stale ring file");
            fs::remove_file(path).map_err(|e| RingError::io(path, e))?;
        }

        // Unique staging name next to the target, removed if anything fails.
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let prefix = format!(
            ".{}.",
            path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
        );
        let staging = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".init")
            .tempfile_in(dir)
            .map_err(|e| RingError::io(path, e))?;
        staging
            .as_file()
            .set_len(REGION_SIZE as u64)
            .map_err(|e| RingError::io(staging.path(), e))?;

        let region = Self::map(staging.as_file(), path)?;
        // SAFETY: nobody else can see the staging file yet.
        unsafe { region.sync().init()? };
        region.sync().mode.store(mode as u8, Ordering::Release);

        staging.persist(path).map_err(|e| RingError::io(path, e.error))?;
        Ok(region)
    }

    /// Map an existing region created by a writer.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| RingError::io(path, e))?;
        let actual = file.metadata().map_err(|e| RingError::io(path, e))?.len();
        if actual != REGION_SIZE as u64 {
            return Err(RingError::SizeMismatch {
                path: path.display().to_string(),
                actual,
                expected: REGION_SIZE as u64,
            });
        }
        Self::map(&file, path)
    }

    fn map(file: &File, path: &Path) -> Result<Self> {
        // SAFETY: mapping a regular file we just opened read-write; the
        // mapping outlives the descriptor.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                REGION_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(RingError::io(path, io::Error::last_os_error()));
        }
        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| RingError::io(path, io::Error::other("mmap returned null")))?;
        Ok(Self {
            ptr,
            path: path.to_path_buf(),
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    #[inline(always)]
    fn byte(&self, offset: usize) -> &AtomicU8 {
        debug_assert!(offset < SYNC_OFFSET);
        // SAFETY: offset is inside the mapping; AtomicU8 has the layout of u8.
        unsafe { &*(self.ptr.as_ptr().add(offset) as *const AtomicU8) }
    }

    #[inline(always)]
    pub(crate) fn write_cursor(&self) -> &AtomicU8 {
        self.byte(WRITE_CURSOR_OFFSET)
    }

    #[inline(always)]
    pub(crate) fn read_cursor(&self) -> &AtomicU8 {
        self.byte(READ_CURSOR_OFFSET)
    }

    /// Occupancy count of the slot addressed by `cursor`.
    #[inline(always)]
    pub(crate) fn count(&self, cursor: u8) -> &AtomicU8 {
        debug_assert!(is_slot(cursor));
        self.byte(cursor as usize)
    }

    /// Raw pointer to the first byte of the slot addressed by `cursor`.
    #[inline(always)]
    pub(crate) fn slot_ptr(&self, cursor: u8) -> *mut u8 {
        debug_assert!(is_slot(cursor));
        // SAFETY: slot_offset stays below SYNC_OFFSET for every slot cursor.
        unsafe { self.ptr.as_ptr().add(slot_offset(cursor)) }
    }

    #[inline(always)]
    pub(crate) fn sync(&self) -> &SyncBlock {
        // SAFETY: SYNC_OFFSET is 64-byte aligned inside a page-aligned mapping.
        unsafe { &*(self.ptr.as_ptr().add(SYNC_OFFSET) as *const SyncBlock) }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: unmapping the exact range mapped in `map`.
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, REGION_SIZE);
        }
    }
}
