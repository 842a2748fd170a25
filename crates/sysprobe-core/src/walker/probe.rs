//! Probe sequence run by workers against the current target.

use std::fs::OpenOptions;
use std::io::Read;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::ptr;
use std::time::{Duration, Instant};

use crate::rng::Mwc;

/// Scratch buffer size per worker.
pub const PROBE_BUF_SIZE: usize = 4096;
/// Cap on bytes read from one target per probe.
pub const MAX_READ_BYTES: usize = 4096 * PROBE_BUF_SIZE;

/// A read-only anonymous page used as a deliberately bad read destination.
#[derive(Debug)]
pub struct BadBuffer {
    ptr: *mut libc::c_void,
    len: usize,
}

// SAFETY: the page is never written from userspace; only handed to read(2).
unsafe impl Send for BadBuffer {}
unsafe impl Sync for BadBuffer {}

impl BadBuffer {
    pub fn map(len: usize) -> Result<Self, i32> {
        // SAFETY: anonymous private mapping, result checked.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(crate::sandbox::last_errno());
        }
        Ok(Self { ptr, len })
    }

    #[must_use]
    pub fn as_ptr(&self) -> *mut libc::c_void {
        self.ptr
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for BadBuffer {
    fn drop(&mut self) {
        // SAFETY: mapped in `map` with this length.
        unsafe { libc::munmap(self.ptr, self.len) };
    }
}

/// Per-worker state lent to a [`Prober`].
pub struct ProbeContext<'a> {
    /// Time allowed for the random-read phase.
    pub budget: Duration,
    pub scratch: &'a mut [u8],
    pub bad_buffer: &'a BadBuffer,
    pub rng: &'a mut Mwc,
    /// Running with elevated privilege; writes are skipped.
    pub privileged: bool,
}

/// Exercises one target. All failures are swallowed.
pub trait Prober: Send + Sync {
    fn probe(&self, target: &Path, ctx: &mut ProbeContext<'_>);
}

/// Open, random-size reads, a zero-length read, a read into [`BadBuffer`], and a
/// zero-length write when unprivileged.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileProber;

impl Prober for FileProber {
    fn probe(&self, target: &Path, ctx: &mut ProbeContext<'_>) {
        let started = Instant::now();
        let Ok(mut file) = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(target)
        else {
            return;
        };

        let mut total = 0usize;
        while total < MAX_READ_BYTES && started.elapsed() < ctx.budget {
            let cap = ctx.scratch.len();
            let len = (1 + ctx.rng.below(cap as u32) as usize).min(cap);
            match file.read(&mut ctx.scratch[..len]) {
                Ok(0) | Err(_) => break,
                Ok(n) => total += n,
            }
        }

        let fd = file.as_raw_fd();
        // SAFETY: zero-length read; then a read at the current position into a mapped
        // read-only page, which the kernel rejects with EFAULT rather than writing.
        unsafe {
            libc::read(fd, ctx.scratch.as_mut_ptr().cast(), 0);
            libc::read(fd, ctx.bad_buffer.as_ptr(), ctx.bad_buffer.len());
        }
        drop(file);

        if ctx.privileged {
            return;
        }
        if let Ok(file) = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(target)
        {
            // SAFETY: zero-length write from a valid buffer.
            unsafe { libc::write(file.as_raw_fd(), ctx.scratch.as_ptr().cast(), 0) };
        }
    }
}
