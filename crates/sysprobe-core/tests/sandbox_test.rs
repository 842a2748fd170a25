//! FaultSandbox trials in real forked children.
//!
//! Every test forks and some reap with `waitpid(-1)`, so they run one at a time.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use sysprobe_core::sandbox::{HazardArgs, find_operation};
use sysprobe_core::{
    AddressHazard, ChildOutcome, FaultSandbox, NoOomAdjust, NullObserver, OomPolicy, Operation,
    ProbeEvent, ProbeObserver, RunBudget, SandboxContext, SupervisedOutcome,
};
use sysprobe_shm::SharedHeap;

static SERIAL: Mutex<()> = Mutex::new(());

fn no_children_left() -> bool {
    let mut status = 0;
    // SAFETY: non-blocking reap of any child.
    let rc = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
    rc == -1 && std::io::Error::last_os_error().raw_os_error() == Some(libc::ECHILD)
}

fn sandbox(ops: Vec<Operation>, hazards: Vec<AddressHazard>, observer: Arc<dyn ProbeObserver>) -> FaultSandbox {
    FaultSandbox::new(SandboxContext::current(), ops, hazards, observer).expect("sandbox")
}

unsafe fn spin_forever(_: &HazardArgs) -> libc::c_int {
    loop {
        std::hint::spin_loop();
    }
}

unsafe fn raise_segv(_: &HazardArgs) -> libc::c_int {
    unsafe { libc::raise(libc::SIGSEGV) }
}

unsafe fn raise_bus(_: &HazardArgs) -> libc::c_int {
    unsafe { libc::raise(libc::SIGBUS) }
}

/// Page of the shared heap, as seen by the parent before forking.
static HEAP_PAGE: AtomicUsize = AtomicUsize::new(0);

/// Fails with ENOMEM when the heap page is no longer mapped in this process.
unsafe fn touch_heap_page(a: &HazardArgs) -> libc::c_int {
    let mut residency = [0u8; 1];
    unsafe {
        libc::mincore(
            HEAP_PAGE.load(Ordering::Relaxed) as *mut libc::c_void,
            a.page_size,
            residency.as_mut_ptr(),
        )
    }
}

/// Counts into shared memory and records parent-side events.
struct SharedCounter {
    counter: &'static AtomicU64,
    parent: libc::pid_t,
    kill_wrapper_at: Option<u64>,
    events: Mutex<Vec<String>>,
}

impl SharedCounter {
    fn new(kill_wrapper_at: Option<u64>) -> Arc<Self> {
        let heap: &'static SharedHeap =
            Box::leak(Box::new(SharedHeap::with_capacity(4096).expect("heap")));
        Arc::new(Self {
            counter: heap.allocate_counter().expect("counter"),
            // SAFETY: getpid never fails.
            parent: unsafe { libc::getpid() },
            kill_wrapper_at,
            events: Mutex::new(Vec::new()),
        })
    }

    fn in_parent(&self) -> bool {
        // SAFETY: getpid never fails.
        unsafe { libc::getpid() == self.parent }
    }
}

impl ProbeObserver for SharedCounter {
    fn inc_counter(&self) {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        if Some(n) == self.kill_wrapper_at && !self.in_parent() {
            // SAFETY: simulates the OOM killer taking out the wrapper.
            unsafe { libc::kill(libc::getpid(), libc::SIGKILL) };
        }
    }

    fn event(&self, event: &ProbeEvent<'_>) {
        if self.in_parent() {
            self.events.lock().push(event.name().to_string());
        }
    }
}

#[test]
fn hundred_read_null_trials_are_non_fatal() {
    let _serial = SERIAL.lock();
    let observer = SharedCounter::new(None);
    let read = find_operation("read").expect("read op");
    let mut sandbox = sandbox(vec![read], vec![AddressHazard::Null], observer.clone());
    let running = AtomicBool::new(true);

    for _ in 0..100 {
        let report = sandbox
            .run_one_iteration(&running)
            .expect("trial")
            .expect("not cancelled");
        assert_eq!(report.operation, "read");
        assert_eq!(report.hazard, AddressHazard::Null);
        assert!(
            matches!(report.outcome, ChildOutcome::ErrnoValue(_)),
            "unexpected outcome {:?}",
            report.outcome
        );
        assert!(report.elapsed < Duration::from_secs(2));
    }
    assert_eq!(observer.counter.load(Ordering::SeqCst), 100);
    assert_eq!(observer.events.lock().len(), 100);
    assert!(no_children_left());
}

#[test]
fn read_into_null_reports_efault() {
    let _serial = SERIAL.lock();
    let sandbox = sandbox(Vec::new(), Vec::new(), Arc::new(NullObserver));
    let read = find_operation("read").expect("read op");
    let report = sandbox.run_trial(&read, AddressHazard::Null).expect("trial");
    // EPERM only if the privilege drop is refused in this environment
    assert!(matches!(
        report.outcome,
        ChildOutcome::ErrnoValue(libc::EFAULT) | ChildOutcome::ErrnoValue(libc::EPERM)
    ));
}

#[test]
fn watchdog_bounds_a_hanging_call() {
    let _serial = SERIAL.lock();
    let sandbox = sandbox(Vec::new(), Vec::new(), Arc::new(NullObserver));
    let op = Operation::new("spin", spin_forever);
    let report = sandbox.run_trial(&op, AddressHazard::Null).expect("trial");
    assert_eq!(report.outcome, ChildOutcome::TimedOut);
    assert!(report.elapsed < Duration::from_secs(2));
    assert!(no_children_left());
}

#[test]
fn caught_signals_are_classified() {
    let _serial = SERIAL.lock();
    let sandbox = sandbox(Vec::new(), Vec::new(), Arc::new(NullObserver));
    let segv = Operation::new("segv", raise_segv);
    let bus = Operation::new("bus", raise_bus);
    assert_eq!(
        sandbox.run_trial(&segv, AddressHazard::Max).expect("trial").outcome,
        ChildOutcome::Signaled(libc::SIGSEGV)
    );
    assert_eq!(
        sandbox.run_trial(&bus, AddressHazard::Max).expect("trial").outcome,
        ChildOutcome::Signaled(libc::SIGBUS)
    );
}

#[test]
fn iteration_walks_cross_product_and_stops_when_cancelled() {
    let _serial = SERIAL.lock();
    let ops = vec![
        find_operation("time").expect("time"),
        find_operation("times").expect("times"),
    ];
    let mut sandbox = sandbox(
        ops,
        vec![AddressHazard::Null, AddressHazard::Unmapped],
        Arc::new(NullObserver),
    );
    let running = AtomicBool::new(true);
    let mut seen = Vec::new();
    for _ in 0..5 {
        let report = sandbox.run_one_iteration(&running).expect("trial").expect("report");
        seen.push((report.operation, report.hazard));
    }
    assert_eq!(
        seen,
        vec![
            ("time", AddressHazard::Null),
            ("time", AddressHazard::Unmapped),
            ("times", AddressHazard::Null),
            ("times", AddressHazard::Unmapped),
            ("time", AddressHazard::Null),
        ]
    );
    running.store(false, Ordering::Release);
    assert_eq!(sandbox.run_one_iteration(&running).expect("cancelled"), None);
}

#[test]
fn run_loop_honours_op_budget() {
    let _serial = SERIAL.lock();
    let observer = SharedCounter::new(None);
    let mut sandbox = sandbox(
        vec![find_operation("getcwd").expect("getcwd")],
        AddressHazard::ALL.to_vec(),
        observer.clone(),
    );
    let budget = RunBudget::new(observer.counter).with_max_ops(5);
    assert_eq!(sandbox.run_loop(&budget).expect("loop"), 5);
    assert!(no_children_left());
}

#[test]
fn supervised_run_completes_in_wrapper() {
    let _serial = SERIAL.lock();
    let observer = SharedCounter::new(None);
    let mut sandbox = sandbox(
        vec![find_operation("read").expect("read")],
        vec![AddressHazard::ReadOnly],
        observer.clone(),
    );
    let budget = RunBudget::new(observer.counter).with_max_ops(6);
    let outcome = sandbox
        .run_supervised(OomPolicy::Restart, &budget, &NoOomAdjust)
        .expect("supervised");
    assert_eq!(outcome, SupervisedOutcome::Completed { restarts: 0 });
    assert_eq!(observer.counter.load(Ordering::SeqCst), 6);
    assert!(no_children_left());
}

#[test]
fn oom_killed_wrapper_is_restarted() {
    let _serial = SERIAL.lock();
    let observer = SharedCounter::new(Some(2));
    let mut sandbox = sandbox(
        vec![find_operation("read").expect("read")],
        vec![AddressHazard::Null],
        observer.clone(),
    );
    let budget = RunBudget::new(observer.counter).with_max_ops(6);
    let outcome = sandbox
        .run_supervised(OomPolicy::Restart, &budget, &NoOomAdjust)
        .expect("supervised");
    assert_eq!(outcome, SupervisedOutcome::Completed { restarts: 1 });
    assert_eq!(observer.counter.load(Ordering::SeqCst), 6);
    assert_eq!(*observer.events.lock(), vec!["wrapper_restarted".to_string()]);
}

#[test]
fn oom_killed_wrapper_stops_under_stop_policy() {
    let _serial = SERIAL.lock();
    let observer = SharedCounter::new(Some(1));
    let mut sandbox = sandbox(
        vec![find_operation("read").expect("read")],
        vec![AddressHazard::Null],
        observer.clone(),
    );
    let budget = RunBudget::new(observer.counter).with_max_ops(6);
    let outcome = sandbox
        .run_supervised(OomPolicy::Stop, &budget, &NoOomAdjust)
        .expect("supervised");
    assert_eq!(outcome, SupervisedOutcome::OomStopped { restarts: 0 });
    assert_eq!(observer.counter.load(Ordering::SeqCst), 1);
    assert_eq!(*observer.events.lock(), vec!["wrapper_oom_stopped".to_string()]);
}

#[test]
fn trial_child_runs_without_the_shared_heap() {
    let _serial = SERIAL.lock();
    let heap = SharedHeap::with_capacity(4096).expect("heap");
    let kept = heap.intern_const_str("badaddr").expect("intern");
    let page = sysprobe_shm::page_size();
    HEAP_PAGE.store(kept.as_ptr() as usize & !(page - 1), Ordering::Relaxed);
    let op = Operation::new("touch_heap_page", touch_heap_page);

    let unmapped = sandbox(Vec::new(), Vec::new(), Arc::new(NullObserver))
        .with_heap_mapping(heap.inherited_mapping());
    let report = unmapped.run_trial(&op, AddressHazard::Null).expect("trial");
    assert!(
        matches!(report.outcome, ChildOutcome::ErrnoValue(e) if e == libc::ENOMEM || e == libc::EPERM),
        "heap still mapped in child: {:?}",
        report.outcome
    );

    let mapped = sandbox(Vec::new(), Vec::new(), Arc::new(NullObserver));
    let report = mapped.run_trial(&op, AddressHazard::Null).expect("trial");
    assert!(
        matches!(report.outcome, ChildOutcome::Success | ChildOutcome::ErrnoValue(libc::EPERM)),
        "unexpected outcome {:?}",
        report.outcome
    );

    assert_eq!(&*kept, "badaddr");
    assert_eq!(heap.usage().expect("usage").interned, 1);
    assert!(no_children_left());
}
