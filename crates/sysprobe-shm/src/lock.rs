//! Process-shared mutex.
//!
//! `parking_lot` locks live in process-private memory and cannot coordinate forked
//! children, so the shared heap uses a pthread mutex initialised with
//! `PTHREAD_PROCESS_SHARED` directly inside its mapping.
//!
//! The mutex is the `ERRORCHECK` kind: relocking from the owning thread reports
//! `EDEADLK` instead of hanging. It is *not* robust; a holder that dies inside the
//! critical section leaves the lock held for every other process.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;

/// A pthread mutex usable across `fork()` when placed in `MAP_SHARED` memory.
#[repr(C)]
pub struct ProcessLock {
    mutex: UnsafeCell<libc::pthread_mutex_t>,
}

// SAFETY: every access to the inner mutex goes through pthread calls, which are
// designed for concurrent use from multiple threads and processes.
unsafe impl Sync for ProcessLock {}
unsafe impl Send for ProcessLock {}

impl ProcessLock {
    /// Initialise a process-shared mutex in place.
    ///
    /// Returns the pthread error code on failure.
    ///
    /// # Safety
    ///
    /// `slot` must be valid for writes, aligned for `ProcessLock`, not currently
    /// initialised, and must outlive every user of the lock.
    pub unsafe fn init_in_place(slot: *mut ProcessLock) -> Result<(), i32> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        // SAFETY: attr is a valid out-pointer for the attribute object.
        let rc = unsafe { libc::pthread_mutexattr_init(attr.as_mut_ptr()) };
        if rc != 0 {
            return Err(rc);
        }

        // SAFETY: attr was initialised above and is destroyed on every path below.
        let rc = unsafe {
            let rc = libc::pthread_mutexattr_setpshared(
                attr.as_mut_ptr(),
                libc::PTHREAD_PROCESS_SHARED,
            );
            if rc == 0 {
                libc::pthread_mutexattr_settype(attr.as_mut_ptr(), libc::PTHREAD_MUTEX_ERRORCHECK)
            } else {
                rc
            }
        };
        if rc != 0 {
            // SAFETY: attr is initialised.
            unsafe { libc::pthread_mutexattr_destroy(attr.as_mut_ptr()) };
            return Err(rc);
        }

        // SAFETY: caller guarantees slot is writable and aligned; attr is initialised.
        let rc = unsafe {
            let rc = libc::pthread_mutex_init(
                UnsafeCell::raw_get(std::ptr::addr_of!((*slot).mutex)),
                attr.as_ptr(),
            );
            libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
            rc
        };
        if rc != 0 { Err(rc) } else { Ok(()) }
    }

    /// Block until the lock is held.
    ///
    /// Fails with the pthread error code (`EDEADLK` when the calling thread already
    /// holds it).
    pub fn acquire(&self) -> Result<ProcessLockGuard<'_>, i32> {
        #[cfg(test)]
        if inject::should_fail() {
            return Err(libc::EAGAIN);
        }

        // SAFETY: the mutex was initialised by `init_in_place`.
        let rc = unsafe { libc::pthread_mutex_lock(self.mutex.get()) };
        if rc != 0 {
            return Err(rc);
        }
        Ok(ProcessLockGuard { lock: self })
    }

    /// Destroy the mutex.
    ///
    /// # Safety
    ///
    /// No process may hold or later use the lock.
    pub unsafe fn destroy(&self) -> i32 {
        // SAFETY: forwarded to caller.
        unsafe { libc::pthread_mutex_destroy(self.mutex.get()) }
    }
}

/// RAII guard releasing a [`ProcessLock`] on drop.
pub struct ProcessLockGuard<'a> {
    lock: &'a ProcessLock,
}

impl Drop for ProcessLockGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard exists only while this thread owns the mutex.
        unsafe { libc::pthread_mutex_unlock(self.lock.mutex.get()) };
    }
}

/// Deterministic acquisition failures for unit tests.
#[cfg(test)]
pub(crate) mod inject {
    use std::cell::Cell;

    thread_local! {
        /// Acquisitions left before the next one fails; `None` disables injection.
        static FAIL_AFTER: Cell<Option<u32>> = const { Cell::new(None) };
    }

    pub(crate) fn fail_after(successes: u32) {
        FAIL_AFTER.with(|c| c.set(Some(successes)));
    }

    pub(crate) fn clear() {
        FAIL_AFTER.with(|c| c.set(None));
    }

    pub(super) fn should_fail() -> bool {
        FAIL_AFTER.with(|c| match c.get() {
            Some(0) => {
                c.set(None);
                true
            }
            Some(n) => {
                c.set(Some(n - 1));
                false
            }
            None => false,
        })
    }
}
