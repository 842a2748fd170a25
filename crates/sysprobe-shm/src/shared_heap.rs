//! Process-shared bump heap with string interning.
//!
//! Layout of the mapping:
//!
//! ```text
//! +------------------+-------------------------------------------+
//! | HeapHeader page  | data pages (capacity bytes, bump-allocated) |
//! +------------------+-------------------------------------------+
//! ```
//!
//! The header holds the process-shared lock, the bump offset, the sticky
//! out-of-memory flag and the head of the interned-string list. Interned strings
//! are stored as a [`StrNode`] immediately followed by the string bytes.
//!
//! Because the region is `MAP_SHARED` and mapped before any fork, every process in
//! the harness tree sees the same addresses, so a pointer returned to one process
//! is valid (and identical) in all others.

use std::fmt;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use thiserror::Error;

use crate::lock::ProcessLock;
use crate::{page_size, round_up};

/// Platform ceiling on the heap size derived from a [`HeapConfig`].
pub const DEFAULT_CEILING: usize = 64 * 1024;

/// Allocation granularity: every block starts and ends on a pointer boundary.
const ALIGN: usize = align_of::<usize>();

/// Errors reported by [`SharedHeap`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("mmap of {len} shared bytes failed (errno {errno})")]
    MapFailed { len: usize, errno: i32 },
    #[error("cannot create process-shared lock (error {0})")]
    LockCreateFailed(i32),
    #[error("cannot acquire shared heap lock (error {0})")]
    LockFailed(i32),
    #[error("shared heap exhausted: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },
    #[error("shared heap already released")]
    Released,
}

/// Sizing input for [`SharedHeap::init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Number of descriptor strings the callers expect to intern.
    pub expected_strings: usize,
    /// Budget per string, node overhead included.
    pub bytes_per_string: usize,
    /// Upper bound on the computed size before page rounding.
    pub ceiling: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::for_strings(64)
    }
}

impl HeapConfig {
    #[must_use]
    pub fn for_strings(expected_strings: usize) -> Self {
        Self {
            expected_strings,
            bytes_per_string: 32 + size_of::<usize>(),
            ceiling: DEFAULT_CEILING,
        }
    }

    /// Requested data size before page rounding.
    #[must_use]
    pub fn region_bytes(&self) -> usize {
        self.expected_strings
            .saturating_mul(self.bytes_per_string)
            .min(self.ceiling)
    }
}

/// Utilisation snapshot, returned by [`SharedHeap::deinit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapUsage {
    pub used: usize,
    pub capacity: usize,
    pub out_of_memory: bool,
    pub interned: usize,
}

impl HeapUsage {
    #[must_use]
    pub fn utilization_percent(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.used as f64 * 100.0 / self.capacity as f64
    }

    /// Human-readable teardown lines.
    #[must_use]
    pub fn diagnostics(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "shared heap: {} of {} bytes used ({:.1}%), {} strings interned",
            self.used,
            self.capacity,
            self.utilization_percent(),
            self.interned
        )];
        if self.out_of_memory {
            lines.push(
                "shared heap: ran out of memory; some descriptors were not shared".to_string(),
            );
        }
        lines
    }
}

#[repr(C)]
struct HeapHeader {
    lock: ProcessLock,
    offset: AtomicUsize,
    capacity: usize,
    out_of_memory: AtomicBool,
    str_list_head: AtomicPtr<StrNode>,
    interned: AtomicUsize,
}

#[repr(C)]
struct StrNode {
    next: *mut StrNode,
    len: usize,
}

impl StrNode {
    /// # Safety
    /// `node` must point at a fully written node inside a live region.
    unsafe fn bytes<'a>(node: *const StrNode) -> &'a [u8] {
        // SAFETY: forwarded to caller; the payload follows the node header.
        unsafe {
            let len = (*node).len;
            std::slice::from_raw_parts(node.add(1).cast::<u8>(), len)
        }
    }
}

/// The live mapping behind a [`SharedHeap`].
struct Region {
    base: NonNull<u8>,
    map_len: usize,
    header: NonNull<HeapHeader>,
    data: NonNull<u8>,
}

impl Region {
    fn header(&self) -> &HeapHeader {
        // SAFETY: the header was initialised in `SharedHeap::with_capacity` and lives
        // as long as the region.
        unsafe { self.header.as_ref() }
    }

    /// Scan the list for `bytes`. Caller holds the lock.
    fn find(&self, bytes: &[u8]) -> Option<NonNull<StrNode>> {
        let mut cursor = self.header().str_list_head.load(Ordering::Relaxed);
        while let Some(node) = NonNull::new(cursor) {
            // SAFETY: every published node was fully written before being linked.
            if unsafe { StrNode::bytes(node.as_ptr()) } == bytes {
                return Some(node);
            }
            // SAFETY: as above.
            cursor = unsafe { (*node.as_ptr()).next };
        }
        None
    }
}

/// Address range of a heap mapping, as seen by a forked child.
///
/// `Copy` and allocation-free so it can be used between `fork` and `_exit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InheritedMapping {
    base: usize,
    len: usize,
}

impl InheritedMapping {
    /// Drop this process's view of the region.
    ///
    /// Returns the raw `munmap` result.
    ///
    /// # Safety
    ///
    /// Nothing in the calling process may touch the heap afterwards. Intended for
    /// forked children that never return to the caller's stack.
    pub unsafe fn unmap(self) -> i32 {
        // SAFETY: forwarded to caller.
        unsafe { libc::munmap(self.base as *mut libc::c_void, self.len) }
    }
}

/// Position of a counter inside a [`SharedHeap`], resolved with
/// [`SharedHeap::counter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSlot {
    offset: usize,
}

/// Process-shared append-only arena.
///
/// Wrap in `Arc` to share between threads; the mapping is inherited across `fork`.
pub struct SharedHeap {
    region: Option<Region>,
    owner_pid: libc::pid_t,
    final_usage: Option<HeapUsage>,
}

// SAFETY: all mutation of shared state happens under the process-shared lock or via
// atomics; the region pointers themselves are immutable after construction.
unsafe impl Send for SharedHeap {}
unsafe impl Sync for SharedHeap {}

impl SharedHeap {
    /// Map a heap sized from `config`.
    pub fn init(config: &HeapConfig) -> Result<Self, HeapError> {
        Self::with_capacity(config.region_bytes())
    }

    /// Map a heap with at least `bytes` of data capacity, rounded up to a page.
    pub fn with_capacity(bytes: usize) -> Result<Self, HeapError> {
        let page = page_size();
        let capacity = round_up(bytes.max(1), page).ok_or(HeapError::MapFailed {
            len: bytes,
            errno: libc::ENOMEM,
        })?;
        let map_len = capacity.checked_add(page).ok_or(HeapError::MapFailed {
            len: bytes,
            errno: libc::ENOMEM,
        })?;
        debug_assert!(size_of::<HeapHeader>() <= page);

        // SAFETY: anonymous mapping with no address hint; result checked below.
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(HeapError::MapFailed {
                len: map_len,
                errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
            });
        }
        let Some(base) = NonNull::new(raw.cast::<u8>()) else {
            return Err(HeapError::MapFailed {
                len: map_len,
                errno: libc::EINVAL,
            });
        };

        let header = base.cast::<HeapHeader>();
        // SAFETY: the mapping is page-aligned, writable and at least one page long,
        // which covers the header.
        unsafe {
            let h = header.as_ptr();
            ptr::addr_of_mut!((*h).offset).write(AtomicUsize::new(0));
            ptr::addr_of_mut!((*h).capacity).write(capacity);
            ptr::addr_of_mut!((*h).out_of_memory).write(AtomicBool::new(false));
            ptr::addr_of_mut!((*h).str_list_head).write(AtomicPtr::new(ptr::null_mut()));
            ptr::addr_of_mut!((*h).interned).write(AtomicUsize::new(0));
            if let Err(rc) = ProcessLock::init_in_place(ptr::addr_of_mut!((*h).lock)) {
                libc::munmap(raw, map_len);
                return Err(HeapError::LockCreateFailed(rc));
            }
        }

        // SAFETY: page < map_len, so the data start is inside the mapping.
        let data = unsafe { base.add(page) };
        Ok(Self {
            region: Some(Region {
                base,
                map_len,
                header,
                data,
            }),
            // SAFETY: getpid never fails.
            owner_pid: unsafe { libc::getpid() },
            final_usage: None,
        })
    }

    fn region(&self) -> Result<&Region, HeapError> {
        self.region.as_ref().ok_or(HeapError::Released)
    }

    /// Bump-allocate `size` bytes, pointer aligned.
    ///
    /// Never blocks beyond the lock and never grows. On exhaustion the sticky
    /// out-of-memory flag is raised.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.allocate_aligned(size, ALIGN)
    }

    fn allocate_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
        let region = self.region()?;
        let header = region.header();
        let _guard = header.lock.acquire().map_err(HeapError::LockFailed)?;

        let offset = header.offset.load(Ordering::Relaxed);
        let available = header.capacity - offset;
        let placed = match (round_up(offset, align.max(ALIGN)), round_up(size, ALIGN)) {
            (Some(start), Some(rounded)) => (start - offset)
                .checked_add(rounded)
                .map(|needed| (start, needed)),
            _ => None,
        };
        let Some((start, needed)) = placed.filter(|(_, needed)| *needed <= available) else {
            header.out_of_memory.store(true, Ordering::Relaxed);
            return Err(HeapError::OutOfMemory {
                requested: size,
                available,
            });
        };

        header.offset.store(offset + needed, Ordering::Relaxed);
        // SAFETY: start < offset + needed <= capacity, so the block lies inside the data pages.
        Ok(unsafe { region.data.add(start) })
    }

    /// Return a shared copy of `text`, reusing an existing node with equal bytes.
    ///
    /// The lock is released while the new node is written. Two processes interning
    /// the same new string concurrently may both allocate; the loser's node is still
    /// linked and only wastes capacity. If the lock cannot be re-acquired to publish,
    /// the copy is returned unpublished.
    pub fn intern_const_str(&self, text: &str) -> Result<SharedStr<'_>, HeapError> {
        let region = self.region()?;
        let header = region.header();
        let bytes = text.as_bytes();

        {
            let _guard = header.lock.acquire().map_err(HeapError::LockFailed)?;
            if let Some(node) = region.find(bytes) {
                return Ok(SharedStr::from_node(node));
            }
        }

        let node = self
            .allocate(size_of::<StrNode>() + bytes.len())?
            .cast::<StrNode>();
        // SAFETY: the block is freshly allocated, pointer aligned and sized for the node
        // plus payload; nobody else can see it yet.
        unsafe {
            node.as_ptr().write(StrNode {
                next: ptr::null_mut(),
                len: bytes.len(),
            });
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                node.as_ptr().add(1).cast::<u8>(),
                bytes.len(),
            );
        }

        if let Ok(_guard) = header.lock.acquire() {
            // SAFETY: the node is still private to this call until the store below.
            unsafe { (*node.as_ptr()).next = header.str_list_head.load(Ordering::Relaxed) };
            header.str_list_head.store(node.as_ptr(), Ordering::Release);
            header.interned.fetch_add(1, Ordering::Relaxed);
        }
        Ok(SharedStr::from_node(node))
    }

    /// Allocate a zeroed 64-bit counter visible to every process sharing the heap.
    pub fn allocate_counter(&self) -> Result<&AtomicU64, HeapError> {
        let block = self.allocate_aligned(size_of::<AtomicU64>(), align_of::<AtomicU64>())?;
        let counter = block.cast::<AtomicU64>();
        // SAFETY: aligned, sized and exclusively owned; lives as long as `self`.
        unsafe {
            counter.as_ptr().write(AtomicU64::new(0));
            Ok(&*counter.as_ptr())
        }
    }

    /// Allocate a counter and return its position, for holders that cannot borrow
    /// the heap.
    pub fn allocate_counter_slot(&self) -> Result<CounterSlot, HeapError> {
        let counter = ptr::from_ref(self.allocate_counter()?) as usize;
        let data = self.region()?.data.as_ptr() as usize;
        Ok(CounterSlot {
            offset: counter - data,
        })
    }

    /// Resolve a slot. `None` once released, or if the slot lies outside the
    /// allocated prefix.
    #[must_use]
    pub fn counter(&self, slot: CounterSlot) -> Option<&AtomicU64> {
        let region = self.region.as_ref()?;
        let used = region.header().offset.load(Ordering::Relaxed);
        let end = slot.offset.checked_add(size_of::<AtomicU64>())?;
        if end > used || slot.offset % align_of::<AtomicU64>() != 0 {
            return None;
        }
        // SAFETY: aligned and inside the allocated data pages; any bit pattern is a
        // valid AtomicU64.
        Some(unsafe { &*region.data.as_ptr().add(slot.offset).cast::<AtomicU64>() })
    }

    /// Live utilisation snapshot.
    pub fn usage(&self) -> Result<HeapUsage, HeapError> {
        let region = self.region()?;
        let header = region.header();
        Ok(HeapUsage {
            used: header.offset.load(Ordering::Relaxed),
            capacity: header.capacity,
            out_of_memory: header.out_of_memory.load(Ordering::Relaxed),
            interned: header.interned.load(Ordering::Relaxed),
        })
    }

    /// Data capacity in bytes, or 0 once released.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.region.as_ref().map_or(0, |r| r.header().capacity)
    }

    #[must_use]
    pub fn is_out_of_memory(&self) -> bool {
        self.region
            .as_ref()
            .is_some_and(|r| r.header().out_of_memory.load(Ordering::Relaxed))
    }

    /// Address range for a forked child to unmap on entry.
    #[must_use]
    pub fn inherited_mapping(&self) -> Option<InheritedMapping> {
        self.region.as_ref().map(|r| InheritedMapping {
            base: r.base.as_ptr() as usize,
            len: r.map_len,
        })
    }

    /// Unmap the region and report final usage.
    ///
    /// The lock is destroyed only by the process that created it. Calling this again
    /// returns the same usage.
    pub fn deinit(&mut self) -> HeapUsage {
        let Some(region) = self.region.take() else {
            return self.final_usage.unwrap_or(HeapUsage {
                used: 0,
                capacity: 0,
                out_of_memory: false,
                interned: 0,
            });
        };

        let header = region.header();
        let usage = HeapUsage {
            used: header.offset.load(Ordering::Relaxed),
            capacity: header.capacity,
            out_of_memory: header.out_of_memory.load(Ordering::Relaxed),
            interned: header.interned.load(Ordering::Relaxed),
        };

        // SAFETY: `&mut self` guarantees no outstanding `SharedStr` or counter borrows
        // in this process; getpid never fails.
        unsafe {
            if libc::getpid() == self.owner_pid {
                header.lock.destroy();
            }
            libc::munmap(region.base.as_ptr().cast::<libc::c_void>(), region.map_len);
        }
        self.final_usage = Some(usage);
        usage
    }
}

impl Drop for SharedHeap {
    fn drop(&mut self) {
        self.deinit();
    }
}

impl fmt::Debug for SharedHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedHeap")
            .field("capacity", &self.capacity())
            .field("released", &self.region.is_none())
            .finish()
    }
}

/// An interned string living in a [`SharedHeap`].
///
/// Equal content interned through the same heap yields the same [`as_ptr`](Self::as_ptr).
#[derive(Clone, Copy)]
pub struct SharedStr<'h> {
    ptr: NonNull<u8>,
    len: usize,
    _heap: PhantomData<&'h SharedHeap>,
}

// SAFETY: the bytes are immutable once written and outlive 'h.
unsafe impl Send for SharedStr<'_> {}
unsafe impl Sync for SharedStr<'_> {}

impl SharedStr<'_> {
    fn from_node(node: NonNull<StrNode>) -> Self {
        // SAFETY: node points at a fully written node whose payload follows it.
        unsafe {
            Self {
                ptr: node.add(1).cast::<u8>(),
                len: (*node.as_ptr()).len,
                _heap: PhantomData,
            }
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        // SAFETY: the payload was copied from a `&str` and is never mutated.
        unsafe {
            std::str::from_utf8_unchecked(std::slice::from_raw_parts(self.ptr.as_ptr(), self.len))
        }
    }

    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }
}

impl Deref for SharedStr<'_> {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for SharedStr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for SharedStr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedStr").field(&self.as_str()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::inject;

    const NODE_BLOCK_8: usize = size_of::<StrNode>() + 8;

    #[test]
    fn config_respects_ceiling() {
        let small = HeapConfig::for_strings(10);
        assert_eq!(small.region_bytes(), 10 * (32 + size_of::<usize>()));
        let huge = HeapConfig::for_strings(1_000_000);
        assert_eq!(huge.region_bytes(), DEFAULT_CEILING);
        let heap = SharedHeap::init(&huge).expect("init");
        assert_eq!(heap.capacity(), DEFAULT_CEILING);
    }

    #[test]
    fn capacity_rounds_up_to_page() {
        let heap = SharedHeap::with_capacity(1).expect("init");
        assert_eq!(heap.capacity(), page_size());
    }

    #[test]
    fn allocations_aligned_in_bounds_and_disjoint() {
        let heap = SharedHeap::with_capacity(4096).expect("init");
        let capacity = heap.capacity();
        let sizes = [1usize, 7, 8, 13, 64, 3, 100];
        let mut ranges = Vec::new();
        for size in sizes {
            let p = heap.allocate(size).expect("allocate").as_ptr() as usize;
            assert_eq!(p % ALIGN, 0, "allocation not pointer aligned");
            ranges.push((p, p + size));
        }
        let lo = ranges.iter().map(|r| r.0).min().unwrap_or(0);
        let hi = ranges.iter().map(|r| r.1).max().unwrap_or(0);
        assert!(hi - lo <= capacity);
        for (i, a) in ranges.iter().enumerate() {
            for b in &ranges[i + 1..] {
                assert!(a.1 <= b.0 || b.1 <= a.0, "overlap {a:?} {b:?}");
            }
        }
        // SAFETY: every returned block is writable for its requested size.
        unsafe {
            for (start, end) in &ranges {
                ptr::write_bytes(*start as *mut u8, 0xAB, end - start);
            }
        }
    }

    #[test]
    fn consecutive_allocations_are_packed_at_rounded_offsets() {
        let heap = SharedHeap::with_capacity(4096).expect("init");
        let first = heap.allocate(3).expect("first").as_ptr() as usize;
        let second = heap.allocate(ALIGN).expect("second").as_ptr() as usize;
        let third = heap.allocate(1).expect("third").as_ptr() as usize;
        assert_eq!(second - first, ALIGN);
        assert_eq!(third - second, ALIGN);
        assert_eq!(heap.usage().expect("usage").used, 3 * ALIGN);
    }

    #[test]
    fn fifty_identical_strings_share_one_node() {
        let heap = SharedHeap::with_capacity(4096).expect("init");
        let first = heap.intern_const_str("abcdefgh").expect("intern");
        for _ in 0..49 {
            let again = heap.intern_const_str("abcdefgh").expect("intern");
            assert_eq!(again.as_ptr(), first.as_ptr());
        }
        let usage = heap.usage().expect("usage");
        assert_eq!(usage.interned, 1);
        assert_eq!(usage.used, round_up(NODE_BLOCK_8, ALIGN).unwrap_or(0));
        assert_eq!(&*first, "abcdefgh");
    }

    #[test]
    fn different_content_gets_different_nodes() {
        let heap = SharedHeap::with_capacity(4096).expect("init");
        let a = heap.intern_const_str("read").expect("a");
        let b = heap.intern_const_str("write").expect("b");
        let empty = heap.intern_const_str("").expect("empty");
        assert_ne!(a.as_ptr(), b.as_ptr());
        assert_eq!(a.to_string(), "read");
        assert_eq!(b.as_str(), "write");
        assert_eq!(empty.len(), 0);
        assert_eq!(heap.intern_const_str("").expect("empty").as_ptr(), empty.as_ptr());
        assert_eq!(heap.usage().expect("usage").interned, 3);
    }

    #[test]
    fn out_of_memory_is_sticky() {
        let heap = SharedHeap::with_capacity(4096).expect("init");
        let capacity = heap.capacity();
        heap.allocate(capacity - ALIGN).expect("fill");
        let err = heap.allocate(ALIGN + 1).expect_err("must not fit");
        assert_eq!(
            err,
            HeapError::OutOfMemory {
                requested: ALIGN + 1,
                available: ALIGN
            }
        );
        assert!(heap.is_out_of_memory());
        heap.allocate(ALIGN).expect("exact fit still works");
        assert!(heap.is_out_of_memory());
        assert!(matches!(
            heap.intern_const_str("no room"),
            Err(HeapError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn failed_relock_returns_unpublished_copy() {
        let heap = SharedHeap::with_capacity(4096).expect("init");
        // scan lock and allocation lock succeed, publish lock fails
        inject::fail_after(2);
        let orphan = heap.intern_const_str("orphan").expect("intern");
        inject::clear();
        assert_eq!(orphan.as_str(), "orphan");
        assert_eq!(heap.usage().expect("usage").interned, 0);

        let published = heap.intern_const_str("orphan").expect("intern");
        assert_ne!(published.as_ptr(), orphan.as_ptr());
        assert_eq!(heap.usage().expect("usage").interned, 1);
    }

    #[test]
    fn lock_failure_aborts_only_that_call() {
        let heap = SharedHeap::with_capacity(4096).expect("init");
        inject::fail_after(0);
        assert_eq!(heap.allocate(8), Err(HeapError::LockFailed(libc::EAGAIN)));
        inject::clear();
        heap.allocate(8).expect("next call succeeds");
    }

    #[test]
    fn counter_is_aligned_and_zeroed() {
        let heap = SharedHeap::with_capacity(4096).expect("init");
        heap.allocate(3).expect("misalign offset");
        let counter = heap.allocate_counter().expect("counter");
        assert_eq!(counter as *const AtomicU64 as usize % align_of::<AtomicU64>(), 0);
        assert_eq!(counter.fetch_add(5, Ordering::Relaxed), 0);
        assert_eq!(counter.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn counter_slot_resolves_until_release() {
        let mut heap = SharedHeap::with_capacity(4096).expect("init");
        let slot = heap.allocate_counter_slot().expect("slot");
        heap.counter(slot).expect("resolve").fetch_add(2, Ordering::Relaxed);
        assert_eq!(heap.counter(slot).expect("resolve").load(Ordering::Relaxed), 2);
        heap.deinit();
        assert!(heap.counter(slot).is_none());
    }

    #[test]
    fn deinit_is_idempotent() {
        let mut heap = SharedHeap::with_capacity(4096).expect("init");
        heap.intern_const_str("x").expect("intern");
        let first = heap.deinit();
        let second = heap.deinit();
        assert_eq!(first, second);
        assert_eq!(first.interned, 1);
        assert_eq!(heap.allocate(8), Err(HeapError::Released));
        assert!(heap.inherited_mapping().is_none());
        assert_eq!(heap.capacity(), 0);
    }

    #[test]
    fn diagnostics_mention_oom() {
        let usage = HeapUsage {
            used: 2048,
            capacity: 4096,
            out_of_memory: true,
            interned: 4,
        };
        let lines = usage.diagnostics();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("50.0%"));
        assert!(lines[1].contains("out of memory"));
    }
}
