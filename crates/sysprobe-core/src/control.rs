//! Collaborator traits shared by the sandbox and the walker.
//!
//! The core never formats logs or decides run length on its own. Callers supply a
//! [`KeepRunning`] predicate, an [`OomAdjuster`] and a [`ProbeObserver`] that receives
//! typed [`ProbeEvent`]s.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::sandbox::{AddressHazard, ChildOutcome, MemoryInfo};
use crate::walker::WalkerState;

/// Cooperative cancellation predicate, checked at loop boundaries.
pub trait KeepRunning: Sync {
    fn keep_running(&self) -> bool;
}

/// `true` means keep going.
impl KeepRunning for AtomicBool {
    fn keep_running(&self) -> bool {
        self.load(Ordering::Acquire)
    }
}

/// Deadline and operation-count budget.
///
/// Both limits survive `fork`: the deadline is monotonic and the progress counter
/// can live in the shared heap.
#[derive(Debug)]
pub struct RunBudget<'a> {
    deadline: Option<Instant>,
    max_ops: Option<u64>,
    progress: &'a AtomicU64,
    cancel: Option<&'a AtomicBool>,
}

impl<'a> RunBudget<'a> {
    #[must_use]
    pub fn new(progress: &'a AtomicU64) -> Self {
        Self {
            deadline: None,
            max_ops: None,
            progress,
            cancel: None,
        }
    }

    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.deadline = Instant::now().checked_add(duration);
        self
    }

    /// Zero means unlimited.
    #[must_use]
    pub fn with_max_ops(mut self, max_ops: u64) -> Self {
        self.max_ops = (max_ops > 0).then_some(max_ops);
        self
    }

    /// Additional flag; clearing it stops the run.
    #[must_use]
    pub fn with_cancel_flag(mut self, running: &'a AtomicBool) -> Self {
        self.cancel = Some(running);
        self
    }

    #[must_use]
    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::Relaxed)
    }
}

impl KeepRunning for RunBudget<'_> {
    fn keep_running(&self) -> bool {
        if self.cancel.is_some_and(|flag| !flag.load(Ordering::Acquire)) {
            return false;
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return false;
        }
        self.max_ops
            .is_none_or(|max| self.progress.load(Ordering::Relaxed) < max)
    }
}

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn on_interrupt(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Release);
}

/// Process-wide running flag, cleared by `SIGINT`/`SIGTERM` once
/// [`install_interrupt_handler`] has run.
#[must_use]
pub fn running_flag() -> &'static AtomicBool {
    &RUNNING
}

/// Clear [`running_flag`] on `SIGINT` and `SIGTERM`.
///
/// Installed without `SA_RESTART`, so a parent blocked in `waitpid` wakes up and the
/// current trial is cut short. Returns the errno of a failed `sigaction`.
pub fn install_interrupt_handler() -> Result<(), i32> {
    for sig in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: zeroed sigaction with an empty mask and a handler that only stores
        // to an atomic.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction =
                on_interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(sig, &action, std::ptr::null_mut()) != 0 {
                return Err(crate::sandbox::last_errno());
            }
        }
    }
    Ok(())
}

/// Marks the calling process as preferred by the OOM killer.
///
/// Called between `fork` and the child's work, so implementations must not
/// allocate or take locks.
pub trait OomAdjuster: Send + Sync {
    fn make_oom_preferred(&self);
}

/// Writes the maximum score to `/proc/self/oom_score_adj`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcOomAdjuster;

impl OomAdjuster for ProcOomAdjuster {
    fn make_oom_preferred(&self) {
        const SCORE: &[u8] = b"1000";
        // SAFETY: plain syscalls on a static path and buffer; failure is ignored.
        unsafe {
            let fd = libc::open(c"/proc/self/oom_score_adj".as_ptr(), libc::O_WRONLY);
            if fd >= 0 {
                libc::write(fd, SCORE.as_ptr().cast(), SCORE.len());
                libc::close(fd);
            }
        }
    }
}

/// Leaves the OOM score untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOomAdjust;

impl OomAdjuster for NoOomAdjust {
    fn make_oom_preferred(&self) {}
}

/// Typed progress and anomaly reports from the core.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeEvent<'a> {
    TrialCompleted {
        operation: &'a str,
        hazard: AddressHazard,
        outcome: ChildOutcome,
        elapsed: Duration,
    },
    WrapperForkRetry {
        errno: i32,
    },
    WrapperRestarted {
        restarts: u32,
        memory: Option<MemoryInfo>,
    },
    WrapperOomStopped {
        memory: Option<MemoryInfo>,
    },
    TargetPublished {
        path: &'a Path,
    },
    SlowTarget {
        path: &'a Path,
        elapsed: Duration,
    },
    CursorLockTimeout {
        thread: &'a str,
    },
    DrainBurst {
        bytes: usize,
    },
    WorkersAbandoned {
        count: usize,
    },
    WalkerAborted {
        last_target: Option<&'a Path>,
        fault_addr: usize,
    },
    /// A lifecycle step found the run in an unexpected state.
    TransitionRejected {
        from: WalkerState,
        to: WalkerState,
    },
}

impl ProbeEvent<'_> {
    /// Stable snake_case name, used as the log event field.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::TrialCompleted { .. } => "trial_completed",
            Self::WrapperForkRetry { .. } => "wrapper_fork_retry",
            Self::WrapperRestarted { .. } => "wrapper_restarted",
            Self::WrapperOomStopped { .. } => "wrapper_oom_stopped",
            Self::TargetPublished { .. } => "target_published",
            Self::SlowTarget { .. } => "slow_target",
            Self::CursorLockTimeout { .. } => "cursor_lock_timeout",
            Self::DrainBurst { .. } => "drain_burst",
            Self::WorkersAbandoned { .. } => "workers_abandoned",
            Self::WalkerAborted { .. } => "walker_aborted",
            Self::TransitionRejected { .. } => "transition_rejected",
        }
    }
}

/// Receives progress from the sandbox and walker. Called from worker threads.
pub trait ProbeObserver: Send + Sync {
    /// One unit of completed work.
    fn inc_counter(&self) {}

    fn event(&self, _event: &ProbeEvent<'_>) {}

    /// Flush buffered output. Called before every `fork` and before a wrapper exits.
    fn flush(&self) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl ProbeObserver for NullObserver {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_bool_is_a_running_flag() {
        let flag = AtomicBool::new(true);
        assert!(flag.keep_running());
        flag.store(false, Ordering::Release);
        assert!(!flag.keep_running());
    }

    #[test]
    fn budget_stops_at_max_ops() {
        let progress = AtomicU64::new(0);
        let budget = RunBudget::new(&progress).with_max_ops(3);
        assert!(budget.keep_running());
        progress.store(3, Ordering::Relaxed);
        assert!(!budget.keep_running());
        assert_eq!(budget.progress(), 3);
    }

    #[test]
    fn zero_max_ops_is_unlimited() {
        let progress = AtomicU64::new(u64::MAX - 1);
        assert!(RunBudget::new(&progress).with_max_ops(0).keep_running());
    }

    #[test]
    fn budget_stops_at_deadline() {
        let progress = AtomicU64::new(0);
        let budget = RunBudget::new(&progress).with_duration(Duration::ZERO);
        assert!(!budget.keep_running());
        let long = RunBudget::new(&progress).with_duration(Duration::from_secs(3600));
        assert!(long.keep_running());
    }

    #[test]
    fn budget_honours_cancel_flag() {
        let progress = AtomicU64::new(0);
        let running = AtomicBool::new(true);
        let budget = RunBudget::new(&progress).with_cancel_flag(&running);
        assert!(budget.keep_running());
        running.store(false, Ordering::Release);
        assert!(!budget.keep_running());
    }

    #[test]
    fn event_names_are_snake_case() {
        let path = Path::new("/sys/kernel");
        let events = [
            ProbeEvent::TargetPublished { path },
            ProbeEvent::DrainBurst { bytes: 1 },
            ProbeEvent::WalkerAborted {
                last_target: Some(path),
                fault_addr: 0,
            },
            ProbeEvent::TransitionRejected {
                from: WalkerState::Draining,
                to: WalkerState::Draining,
            },
        ];
        for event in &events {
            assert!(event.name().chars().all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }
}
