//! Crash-tolerant concurrent resource walker.
//!
//! One walker thread traverses a directory tree in scrambled order, publishing each
//! eligible file as the shared "current target". A fixed pool of workers race
//! against that target with a bounded probe sequence. A process-wide recovery point
//! turns a segmentation fault on any of these threads into an aborted run instead of
//! a crashed process.
//!
//! Lifecycle: `Idle -> Initializing -> Running -> Draining -> Success | Aborted`.

pub mod cursor;
pub mod drain;
pub mod order;
pub mod probe;
pub mod recovery;
mod signals;

use std::fs;
use std::io;
use std::os::unix::thread::JoinHandleExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;

use crate::control::{NoOomAdjust, OomAdjuster, ProbeEvent, ProbeObserver};
use crate::rng::Mwc;

pub use cursor::TraversalCursor;
pub use drain::{KMSG_PATH, LogDrain};
pub use order::{Denylist, EntryKind};
pub use probe::{BadBuffer, FileProber, PROBE_BUF_SIZE, ProbeContext, Prober};
pub use recovery::{FaultInfo, RecoveryPoint};

use signals::InstalledHandler;

/// Tunables for a walker run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkerConfig {
    pub workers: usize,
    pub max_depth: usize,
    /// Pause after each published target.
    pub quantum: Duration,
    /// Time budget for the read phase of one probe.
    pub target_budget: Duration,
    /// Kernel log source; `None` disables the drain.
    pub drain_source: Option<PathBuf>,
    /// Worker back-off after a log burst.
    pub drain_delay: Duration,
    /// Worker sleep between probes and while idle.
    pub poll_interval: Duration,
    /// Bound on every cursor lock acquisition.
    pub cursor_wait: Duration,
    /// How long `stop` waits for threads to exit.
    pub grace_period: Duration,
    /// Delivered to threads during shutdown to interrupt blocking calls.
    pub unblock_signal: i32,
    pub denylist: Denylist,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_depth: 20,
            quantum: Duration::from_millis(40),
            target_budget: Duration::from_millis(200),
            drain_source: Some(PathBuf::from(KMSG_PATH)),
            drain_delay: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
            cursor_wait: Duration::from_millis(100),
            grace_period: Duration::from_secs(2),
            unblock_signal: libc::SIGUSR1,
            denylist: Denylist::default(),
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WalkerState {
    Idle = 0,
    Initializing = 1,
    Running = 2,
    Draining = 3,
    Success = 4,
    Aborted = 5,
}

impl WalkerState {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Success => "success",
            Self::Aborted => "aborted",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Initializing,
            2 => Self::Running,
            3 => Self::Draining,
            4 => Self::Success,
            5 => Self::Aborted,
            _ => Self::Idle,
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Aborted)
    }

    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Initializing)
                | (Self::Initializing, Self::Running)
                | (Self::Running, Self::Draining)
                | (Self::Draining, Self::Success)
                | (Self::Draining, Self::Aborted)
        )
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    /// A thread faulted. `last_target` is the cursor at abort time, best effort.
    Aborted {
        last_target: Option<PathBuf>,
        fault_addr: usize,
    },
}

#[derive(Debug, Error)]
pub enum WalkerError {
    #[error("segfault recovery point is already armed by another run")]
    RecoveryBusy,
    #[error("cannot install signal handler (errno {0})")]
    Signal(i32),
    #[error("cannot map probe buffer (errno {0})")]
    Map(i32),
    #[error("cannot spawn thread {name}: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("walk root {}: {source}", path.display())]
    Root {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("a walker run needs at least one worker")]
    NoWorkers,
    #[error("invalid walker transition {from:?} -> {to:?}")]
    InvalidTransition { from: WalkerState, to: WalkerState },
}

impl WalkerError {
    #[must_use]
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, Self::Map(_) | Self::ThreadSpawn { .. })
    }
}

fn transition(state: &AtomicU8, from: WalkerState, to: WalkerState) -> Result<(), WalkerError> {
    if !from.can_transition_to(to) {
        return Err(WalkerError::InvalidTransition { from, to });
    }
    state
        .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
        .map(|_| ())
        .map_err(|actual| WalkerError::InvalidTransition {
            from: WalkerState::from_u8(actual),
            to,
        })
}

struct RunShared {
    config: WalkerConfig,
    root: PathBuf,
    cursor: TraversalCursor,
    state: AtomicU8,
    stop: AtomicBool,
    pause_workers: AtomicBool,
    drain: Mutex<LogDrain>,
    observer: Arc<dyn ProbeObserver>,
    prober: Arc<dyn Prober>,
    bad_buffer: BadBuffer,
    privileged: bool,
}

impl RunShared {
    fn keep_running(&self) -> bool {
        !self.stop.load(Ordering::Acquire) && !recovery::is_tripped()
    }

    fn state(&self) -> WalkerState {
        WalkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: WalkerState, to: WalkerState) -> Result<(), WalkerError> {
        transition(&self.state, from, to)
    }

    /// Consume the log source and pause workers while it is bursting. Skipped if
    /// another thread is already draining.
    fn drain_log(&self) {
        let Some(mut drain) = self.drain.try_lock() else {
            return;
        };
        let bytes = drain.drain();
        self.pause_workers.store(bytes > 0, Ordering::Release);
        if bytes > 0 {
            self.observer.event(&ProbeEvent::DrainBurst { bytes });
        }
    }

    /// Sleep up to `total`, waking early on stop or abort.
    fn sleep_while_running(&self, total: Duration) {
        let deadline = Instant::now() + total;
        let slice = self.config.poll_interval.max(Duration::from_millis(1));
        while self.keep_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(slice));
        }
    }
}

/// Starts walker runs. Cheap to keep around; each [`start`](Self::start) is independent.
pub struct ConcurrentWalker {
    config: WalkerConfig,
    observer: Arc<dyn ProbeObserver>,
    prober: Arc<dyn Prober>,
    adjuster: Arc<dyn OomAdjuster>,
}

impl ConcurrentWalker {
    #[must_use]
    pub fn new(config: WalkerConfig, observer: Arc<dyn ProbeObserver>) -> Self {
        Self {
            config,
            observer,
            prober: Arc::new(FileProber),
            adjuster: Arc::new(NoOomAdjust),
        }
    }

    #[must_use]
    pub fn with_prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = prober;
        self
    }

    #[must_use]
    pub fn with_oom_adjuster(mut self, adjuster: Arc<dyn OomAdjuster>) -> Self {
        self.adjuster = adjuster;
        self
    }

    #[must_use]
    pub fn config(&self) -> &WalkerConfig {
        &self.config
    }

    /// Arm the recovery point and spawn the walker plus `workers` probers over `root`.
    pub fn start(&self, root: impl AsRef<Path>, workers: usize) -> Result<RunHandle, WalkerError> {
        if workers == 0 {
            return Err(WalkerError::NoWorkers);
        }
        let root = root.as_ref().to_path_buf();
        match fs::metadata(&root) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(WalkerError::Root {
                    path: root,
                    source: io::Error::from_raw_os_error(libc::ENOTDIR),
                });
            }
            Err(source) => return Err(WalkerError::Root { path: root, source }),
        }

        let state = AtomicU8::new(WalkerState::Idle as u8);
        transition(&state, WalkerState::Idle, WalkerState::Initializing)?;
        let recovery = RecoveryPoint::arm()?;
        let unblock =
            signals::install_unblock_handler(self.config.unblock_signal).map_err(WalkerError::Signal)?;
        let bad_buffer = BadBuffer::map(sysprobe_shm::page_size()).map_err(WalkerError::Map)?;
        let mut drain = self
            .config
            .drain_source
            .as_deref()
            .map_or_else(LogDrain::disabled, LogDrain::open);
        drain.drain();
        self.adjuster.make_oom_preferred();

        let shared = Arc::new(RunShared {
            config: self.config.clone(),
            root,
            cursor: TraversalCursor::new(),
            state,
            stop: AtomicBool::new(false),
            pause_workers: AtomicBool::new(false),
            drain: Mutex::new(drain),
            observer: Arc::clone(&self.observer),
            prober: Arc::clone(&self.prober),
            bad_buffer,
            // SAFETY: geteuid never fails.
            privileged: unsafe { libc::geteuid() } == 0,
        });

        let mut handle = RunHandle {
            shared: Arc::clone(&shared),
            threads: Vec::with_capacity(workers + 1),
            recovery: Some(recovery),
            unblock: Some(unblock),
            outcome: None,
        };

        let walker_shared = Arc::clone(&shared);
        handle.spawn("sysprobe-walker".to_string(), move || walker_main(&walker_shared))?;
        for index in 0..workers {
            let worker_shared = Arc::clone(&shared);
            let name = format!("sysprobe-worker-{index}");
            let thread_name = name.clone();
            handle.spawn(name, move || worker_main(&worker_shared, &thread_name))?;
        }

        shared.transition(WalkerState::Initializing, WalkerState::Running)?;
        Ok(handle)
    }
}

struct RunThread {
    handle: JoinHandle<()>,
}

/// A live walker run. Dropping it stops the run.
pub struct RunHandle {
    shared: Arc<RunShared>,
    threads: Vec<RunThread>,
    recovery: Option<RecoveryPoint>,
    unblock: Option<InstalledHandler>,
    outcome: Option<RunOutcome>,
}

impl RunHandle {
    fn spawn<F>(&mut self, name: String, body: F) -> Result<(), WalkerError>
    where
        F: FnOnce() + Send + 'static,
    {
        match thread::Builder::new().name(name.clone()).spawn(body) {
            Ok(handle) => {
                self.threads.push(RunThread { handle });
                Ok(())
            }
            Err(source) => {
                self.shutdown();
                self.outcome = Some(RunOutcome::Success);
                Err(WalkerError::ThreadSpawn { name, source })
            }
        }
    }

    #[must_use]
    pub fn state(&self) -> WalkerState {
        self.shared.state()
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        matches!(self.outcome, Some(RunOutcome::Aborted { .. }))
            || self.recovery.as_ref().is_some_and(RecoveryPoint::is_tripped)
    }

    /// Block until the run trips its recovery point or `timeout` passes.
    pub fn wait_for_abort(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_aborted() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep((deadline - now).min(self.shared.config.poll_interval));
        }
    }

    /// Stop the run and report how it ended. Idempotent.
    pub fn stop(&mut self) -> RunOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        self.advance(WalkerState::Running, WalkerState::Draining);

        let last_target = self
            .shared
            .cursor
            .last_published(self.shared.config.cursor_wait);
        let fault = self.shutdown();

        let outcome = match fault {
            Some(fault) => RunOutcome::Aborted {
                last_target,
                fault_addr: fault.addr,
            },
            None => RunOutcome::Success,
        };
        let terminal = match outcome {
            RunOutcome::Success => WalkerState::Success,
            RunOutcome::Aborted { .. } => WalkerState::Aborted,
        };
        self.advance(WalkerState::Draining, terminal);

        if let RunOutcome::Aborted {
            last_target,
            fault_addr,
        } = &outcome
        {
            self.shared.observer.event(&ProbeEvent::WalkerAborted {
                last_target: last_target.as_deref(),
                fault_addr: *fault_addr,
            });
        }
        self.shared.observer.flush();
        self.outcome = Some(outcome.clone());
        outcome
    }

    /// Apply a lifecycle step, reporting it to the observer if the run is elsewhere.
    fn advance(&self, from: WalkerState, to: WalkerState) {
        if let Err(WalkerError::InvalidTransition { from, to }) = self.shared.transition(from, to) {
            self.shared
                .observer
                .event(&ProbeEvent::TransitionRejected { from, to });
        }
    }

    /// Signal stop, clear the cursor, unblock and join threads, restore signals.
    /// Returns the recorded fault, if the recovery point tripped.
    fn shutdown(&mut self) -> Option<FaultInfo> {
        let config = &self.shared.config;
        self.shared.stop.store(true, Ordering::Release);
        if !self.shared.cursor.clear(config.cursor_wait) {
            self.shared
                .observer
                .event(&ProbeEvent::CursorLockTimeout { thread: "supervisor" });
        }

        let deadline = Instant::now() + config.grace_period;
        let slice = config.poll_interval.clamp(Duration::from_millis(1), Duration::from_millis(10));
        loop {
            let parked = self.parked_thread();
            let pending: Vec<&RunThread> = self
                .threads
                .iter()
                .filter(|t| !t.handle.is_finished())
                .filter(|t| Some(t.handle.as_pthread_t() as usize) != parked)
                .collect();
            if pending.is_empty() || Instant::now() >= deadline {
                break;
            }
            for thread in pending {
                // SAFETY: the thread has not been joined, so its pthread_t is valid.
                unsafe { libc::pthread_kill(thread.handle.as_pthread_t(), config.unblock_signal) };
            }
            thread::sleep(slice);
        }

        let fault = self.recovery.as_ref().and_then(RecoveryPoint::fault);
        let parked = fault.map(|f| f.thread);
        let mut stuck = 0usize;
        for thread in self.threads.drain(..) {
            if thread.handle.is_finished() {
                let _ = thread.handle.join();
            } else if Some(thread.handle.as_pthread_t() as usize) != parked {
                stuck += 1;
            }
        }
        if stuck > 0 {
            self.shared
                .observer
                .event(&ProbeEvent::WorkersAbandoned { count: stuck });
        }

        drop(self.recovery.take());
        if let Some(unblock) = self.unblock.take() {
            if stuck == 0 {
                drop(unblock);
            } else {
                // stuck threads may still receive the unblock signal
                unblock.leak();
            }
        }
        fault
    }

    fn parked_thread(&self) -> Option<usize> {
        self.recovery
            .as_ref()
            .and_then(RecoveryPoint::fault)
            .map(|f| f.thread)
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn walker_main(shared: &RunShared) {
    let mut rng = Mwc::from_entropy();
    while shared.keep_running() {
        let published = visit(shared, &shared.root, 0, &mut rng);
        if published == 0 {
            shared.sleep_while_running(shared.config.quantum.max(shared.config.poll_interval));
        }
    }
}

fn visit(shared: &RunShared, dir: &Path, depth: usize, rng: &mut Mwc) -> usize {
    if depth > shared.config.max_depth {
        return 0;
    }
    let mut published = 0;
    for entry in order::scan_dir(dir, rng.next_u32(), &shared.config.denylist) {
        if !shared.keep_running() {
            break;
        }
        match entry.kind {
            EntryKind::Directory => published += visit(shared, &entry.path, depth + 1, rng),
            EntryKind::File => {
                if publish_target(shared, &entry.path) {
                    published += 1;
                }
            }
        }
    }
    published
}

fn publish_target(shared: &RunShared, path: &Path) -> bool {
    if !shared.cursor.publish(path, shared.config.cursor_wait) {
        shared
            .observer
            .event(&ProbeEvent::CursorLockTimeout { thread: "walker" });
        return false;
    }
    shared.observer.inc_counter();
    shared.observer.event(&ProbeEvent::TargetPublished { path });

    shared.drain_log();
    shared.sleep_while_running(shared.config.quantum);
    true
}

fn worker_main(shared: &RunShared, name: &str) {
    let config = &shared.config;
    let mut target = PathBuf::new();
    let mut scratch = vec![0u8; PROBE_BUF_SIZE];
    let mut rng = Mwc::from_entropy();

    while shared.keep_running() {
        shared.drain_log();
        if shared.pause_workers.load(Ordering::Acquire) {
            shared.sleep_while_running(config.drain_delay);
            continue;
        }
        match shared.cursor.snapshot_into(&mut target, config.cursor_wait) {
            None => {
                shared
                    .observer
                    .event(&ProbeEvent::CursorLockTimeout { thread: name });
                continue;
            }
            Some(false) => {
                shared.sleep_while_running(config.poll_interval);
                continue;
            }
            Some(true) => {}
        }

        let started = Instant::now();
        let mut ctx = ProbeContext {
            budget: config.target_budget,
            scratch: &mut scratch,
            bad_buffer: &shared.bad_buffer,
            rng: &mut rng,
            privileged: shared.privileged,
        };
        shared.prober.probe(&target, &mut ctx);
        let elapsed = started.elapsed();
        if elapsed > config.target_budget {
            shared.observer.event(&ProbeEvent::SlowTarget {
                path: &target,
                elapsed,
            });
        }
        shared.sleep_while_running(config.poll_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::NullObserver;

    fn quick_config() -> WalkerConfig {
        WalkerConfig {
            quantum: Duration::from_millis(1),
            drain_source: None,
            poll_interval: Duration::from_millis(1),
            ..WalkerConfig::default()
        }
    }

    #[test]
    fn transitions_follow_the_lifecycle() {
        use WalkerState::*;
        assert!(Idle.can_transition_to(Initializing));
        assert!(Initializing.can_transition_to(Running));
        assert!(Running.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Success));
        assert!(Draining.can_transition_to(Aborted));
        assert!(!Idle.can_transition_to(Running));
        assert!(!Running.can_transition_to(Success));
        assert!(!Success.can_transition_to(Idle));
        assert!(Aborted.is_terminal() && !Draining.is_terminal());
        for v in 0..=5u8 {
            assert_eq!(WalkerState::from_u8(v) as u8, v);
        }
    }

    #[test]
    fn start_rejects_bad_arguments() {
        let walker = ConcurrentWalker::new(quick_config(), Arc::new(NullObserver));
        assert!(matches!(walker.start("/", 0), Err(WalkerError::NoWorkers)));
        assert!(matches!(
            walker.start("/nonexistent/sysprobe/root", 1),
            Err(WalkerError::Root { .. })
        ));
        assert!(matches!(
            walker.start("/proc/self/status", 1),
            Err(WalkerError::Root { .. })
        ));
    }

    #[test]
    fn concurrent_start_is_busy_and_stop_is_idempotent() {
        let _serial = recovery::TEST_SERIAL.lock();
        let root = std::env::temp_dir().join(format!("sysprobe-walker-unit-{}", std::process::id()));
        fs::create_dir_all(&root).expect("create root");
        let walker = ConcurrentWalker::new(
            WalkerConfig {
                max_depth: 0,
                ..quick_config()
            },
            Arc::new(NullObserver),
        );
        let mut first = walker.start(&root, 2).expect("first run");
        assert_eq!(first.state(), WalkerState::Running);
        assert!(matches!(walker.start(&root, 2), Err(WalkerError::RecoveryBusy)));

        assert_eq!(first.stop(), RunOutcome::Success);
        assert_eq!(first.state(), WalkerState::Success);
        assert_eq!(first.stop(), RunOutcome::Success);
        assert!(!first.is_aborted());

        let mut second = walker.start(&root, 1).expect("re-armed after stop");
        assert_eq!(second.stop(), RunOutcome::Success);
        let _ = fs::remove_dir_all(&root);
    }

    #[derive(Default)]
    struct Rejections(parking_lot::Mutex<Vec<(WalkerState, WalkerState)>>);

    impl ProbeObserver for Rejections {
        fn event(&self, event: &ProbeEvent<'_>) {
            if let ProbeEvent::TransitionRejected { from, to } = event {
                self.0.lock().push((*from, *to));
            }
        }
    }

    #[test]
    fn out_of_order_stop_reports_rejected_transition() {
        let _serial = recovery::TEST_SERIAL.lock();
        let root = std::env::temp_dir().join(format!("sysprobe-walker-reject-{}", std::process::id()));
        fs::create_dir_all(&root).expect("create root");
        let observer = Arc::new(Rejections::default());
        let walker = ConcurrentWalker::new(quick_config(), observer.clone());
        let mut run = walker.start(&root, 1).expect("start");
        run.shared
            .state
            .store(WalkerState::Draining as u8, Ordering::Release);

        assert_eq!(run.stop(), RunOutcome::Success);
        assert_eq!(run.state(), WalkerState::Success);
        assert_eq!(
            *observer.0.lock(),
            vec![(WalkerState::Draining, WalkerState::Draining)]
        );
        let _ = fs::remove_dir_all(&root);
    }
}
