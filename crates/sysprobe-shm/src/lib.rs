//! # sysprobe-shm
//!
//! Cross-process coordination memory for sysprobe.
//!
//! The stressors fork freely: trial children, supervised wrapper processes and the
//! harness itself all need to see the same descriptor strings and counters. This crate
//! provides the one region they share:
//!
//! - [`ProcessLock`]: a `PTHREAD_PROCESS_SHARED` mutex placed inside shared memory.
//! - [`SharedHeap`]: a `MAP_SHARED | MAP_ANONYMOUS` bump arena with string interning.
//!
//! Nothing allocated from the heap is ever freed; the whole region is released at
//! teardown.

pub mod lock;
pub mod shared_heap;

pub use lock::{ProcessLock, ProcessLockGuard};
pub use shared_heap::{
    CounterSlot, HeapConfig, HeapError, HeapUsage, InheritedMapping, SharedHeap, SharedStr,
};

/// System page size, falling back to 4 KiB if `sysconf` cannot report it.
#[must_use]
pub fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if raw > 0 { raw as usize } else { 4096 }
}

/// Round `value` up to the next multiple of `align` (a power of two).
///
/// Returns `None` on overflow.
#[inline]
#[must_use]
pub fn round_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
    }

    #[test]
    fn round_up_behaves_at_boundaries() {
        assert_eq!(round_up(0, 8), Some(0));
        assert_eq!(round_up(1, 8), Some(8));
        assert_eq!(round_up(8, 8), Some(8));
        assert_eq!(round_up(4097, 4096), Some(8192));
        assert_eq!(round_up(usize::MAX, 8), None);
    }
}
