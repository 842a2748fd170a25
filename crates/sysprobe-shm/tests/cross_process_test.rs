//! Cross-process behaviour of the shared heap: a forked child's writes are visible to
//! the parent at the same addresses.

use std::sync::atomic::Ordering;

use sysprobe_shm::{HeapConfig, SharedHeap};

fn wait_exit_code(pid: libc::pid_t) -> i32 {
    let mut status = 0;
    // SAFETY: pid is our own child.
    let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(rc, pid, "waitpid failed");
    assert!(libc::WIFEXITED(status), "child did not exit normally: {status:#x}");
    libc::WEXITSTATUS(status)
}

#[test]
fn child_interned_string_is_reused_by_parent() {
    let heap = SharedHeap::init(&HeapConfig::for_strings(32)).expect("init");
    let slot = heap.allocate_counter().expect("slot");

    // SAFETY: the child only touches pre-mapped shared memory and exits with _exit.
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");
    if pid == 0 {
        let code = match heap.intern_const_str("sysbadaddr") {
            Ok(s) => {
                slot.store(s.as_ptr() as u64, Ordering::Release);
                0
            }
            Err(_) => 1,
        };
        // SAFETY: terminate the child without running parent-owned destructors.
        unsafe { libc::_exit(code) };
    }

    assert_eq!(wait_exit_code(pid), 0);
    let from_child = slot.load(Ordering::Acquire);
    assert_ne!(from_child, 0);

    let mine = heap.intern_const_str("sysbadaddr").expect("intern");
    assert_eq!(mine.as_ptr() as u64, from_child);
    assert_eq!(heap.usage().expect("usage").interned, 1);
}

#[test]
fn counter_increments_from_children_accumulate() {
    let heap = SharedHeap::with_capacity(4096).expect("init");
    let counter = heap.allocate_counter().expect("counter");

    let mut children = Vec::new();
    for _ in 0..4 {
        // SAFETY: see above.
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0, "fork failed");
        if pid == 0 {
            for _ in 0..25 {
                counter.fetch_add(1, Ordering::Relaxed);
            }
            // SAFETY: see above.
            unsafe { libc::_exit(0) };
        }
        children.push(pid);
    }
    for pid in children {
        assert_eq!(wait_exit_code(pid), 0);
    }
    assert_eq!(counter.load(Ordering::Relaxed), 100);
}

#[test]
fn child_unmapping_does_not_affect_parent() {
    let mut heap = SharedHeap::with_capacity(4096).expect("init");
    let before = heap.intern_const_str("kept").expect("intern").as_ptr();
    let mapping = heap.inherited_mapping().expect("mapped");

    // SAFETY: the child unmaps and exits without touching the heap again.
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");
    if pid == 0 {
        let rc = unsafe { mapping.unmap() };
        unsafe { libc::_exit(if rc == 0 { 0 } else { 1 }) };
    }
    assert_eq!(wait_exit_code(pid), 0);

    assert_eq!(heap.intern_const_str("kept").expect("intern").as_ptr(), before);
    let usage = heap.deinit();
    assert_eq!(usage.interned, 1);
    assert!(!usage.out_of_memory);
}
