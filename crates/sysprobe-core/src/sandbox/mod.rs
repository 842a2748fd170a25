//! Per-trial process isolation for hazardous system calls.
//!
//! Each (operation, hazard) pair runs in its own forked child under resource
//! limits, reduced privilege and a 100 ms watchdog. Whatever the child does, the
//! parent only sees an exit status, which it classifies into a [`ChildOutcome`].
//! Faults inside the child are the expected result of a trial, never a harness error.

pub mod child;
pub mod hazards;
pub mod ops;

use std::sync::Arc;
use std::time::{Duration, Instant};

use libc::pid_t;
use sysprobe_shm::InheritedMapping;
use thiserror::Error;

use crate::config::OomPolicy;
use crate::control::{KeepRunning, OomAdjuster, ProbeEvent, ProbeObserver};

pub use child::{CPU_LIMIT_SECS, FATAL_SIGNALS, FAULT_STATUS_BASE, classify, classify_trial};
pub use hazards::{AddressHazard, HazardPages};
pub use ops::{HazardArgs, OPERATIONS, Operation, find_operation, select_operations};

/// Exit status of a supervised wrapper that hit resource exhaustion.
pub const WRAPPER_NO_RESOURCE: i32 = 3;

/// Pause between wrapper fork attempts that failed with `EAGAIN`.
const FORK_RETRY_DELAY: Duration = Duration::from_millis(10);

pub(crate) fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// How a trial child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildOutcome {
    Success,
    ErrnoValue(i32),
    Signaled(i32),
    TimedOut,
    OomKilled,
}

impl ChildOutcome {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::ErrnoValue(_) => "errno",
            Self::Signaled(_) => "signaled",
            Self::TimedOut => "timed_out",
            Self::OomKilled => "oom_killed",
        }
    }
}

/// Free/total memory at the time of an OOM kill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub total_ram: u64,
    pub free_ram: u64,
    pub free_swap: u64,
}

impl MemoryInfo {
    #[must_use]
    pub fn sample() -> Option<Self> {
        // SAFETY: sysinfo fills a caller-provided struct; zeroed is a valid start.
        let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
        if unsafe { libc::sysinfo(&mut info) } != 0 {
            return None;
        }
        let unit = u64::from(info.mem_unit.max(1));
        Some(Self {
            total_ram: info.totalram as u64 * unit,
            free_ram: info.freeram as u64 * unit,
            free_swap: info.freeswap as u64 * unit,
        })
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("fork failed (errno {0})")]
    Fork(i32),
    #[error("waitpid on {pid} failed (errno {errno})")]
    Wait { pid: pid_t, errno: i32 },
    #[error("cannot map hazard pages (errno {0})")]
    Map(i32),
    #[error("supervised wrapper ended abnormally (wait status {0:#x})")]
    Wrapper(i32),
}

impl SandboxError {
    /// Whether this is a fork/wait/map exhaustion rather than a wrapper failure.
    #[must_use]
    pub fn is_resource_exhaustion(&self) -> bool {
        match self {
            Self::Fork(_) | Self::Wait { .. } | Self::Map(_) => true,
            Self::Wrapper(status) => {
                libc::WIFEXITED(*status) && libc::WEXITSTATUS(*status) == WRAPPER_NO_RESOURCE
            }
        }
    }
}

/// Process-level facts a trial needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxContext {
    pub page_size: usize,
    /// Process group children join; 0 leaves them in the inherited group.
    pub pgrp: pid_t,
}

impl SandboxContext {
    #[must_use]
    pub fn current() -> Self {
        Self {
            page_size: sysprobe_shm::page_size(),
            // SAFETY: getpgrp never fails.
            pgrp: unsafe { libc::getpgrp() },
        }
    }
}

/// Result of one trial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialReport {
    pub operation: &'static str,
    pub hazard: AddressHazard,
    pub outcome: ChildOutcome,
    pub elapsed: Duration,
}

/// How [`FaultSandbox::run_supervised`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisedOutcome {
    /// The budget ran out.
    Completed { restarts: u32 },
    /// The wrapper was OOM-killed under [`OomPolicy::Stop`].
    OomStopped { restarts: u32 },
}

/// Runs the operation x hazard cross product, one forked child per trial.
pub struct FaultSandbox {
    ctx: SandboxContext,
    ops: Vec<Operation>,
    hazards: Vec<AddressHazard>,
    pages: HazardPages,
    heap: Option<InheritedMapping>,
    observer: Arc<dyn ProbeObserver>,
    next: usize,
}

impl FaultSandbox {
    pub fn new(
        ctx: SandboxContext,
        ops: Vec<Operation>,
        hazards: Vec<AddressHazard>,
        observer: Arc<dyn ProbeObserver>,
    ) -> Result<Self, SandboxError> {
        let pages = HazardPages::new(ctx.page_size)?;
        Ok(Self {
            ctx,
            ops,
            hazards,
            pages,
            heap: None,
            observer,
            next: 0,
        })
    }

    /// Shared heap mapping that trial children drop on entry.
    #[must_use]
    pub fn with_heap_mapping(mut self, mapping: Option<InheritedMapping>) -> Self {
        self.heap = mapping;
        self
    }

    /// Number of distinct trials in one pass.
    #[must_use]
    pub fn trials_per_pass(&self) -> usize {
        self.ops.len() * self.hazards.len()
    }

    /// Fork one child, run `op` against `hazard`, classify how it ended.
    pub fn run_trial(
        &self,
        op: &Operation,
        hazard: AddressHazard,
    ) -> Result<TrialReport, SandboxError> {
        let plan = child::ChildPlan {
            op: *op,
            args: HazardArgs {
                addr: self.pages.address(hazard),
                ro_page: self.pages.ro_page(),
                page_size: self.pages.page_size(),
            },
            pgrp: self.ctx.pgrp,
            // SAFETY: getpid never fails.
            parent: unsafe { libc::getpid() },
            heap: self.heap,
        };

        let started = Instant::now();
        // SAFETY: the child only makes async-signal-safe calls before `_exit`.
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(SandboxError::Fork(last_errno()));
        }
        if pid == 0 {
            child::run(&plan);
        }

        let outcome = reap(pid)?;
        Ok(TrialReport {
            operation: op.name,
            hazard,
            outcome,
            elapsed: started.elapsed(),
        })
    }

    /// Run the next trial of the cross product, or `None` once cancelled.
    pub fn run_one_iteration(
        &mut self,
        keep_running: &dyn KeepRunning,
    ) -> Result<Option<TrialReport>, SandboxError> {
        let total = self.trials_per_pass();
        if total == 0 || !keep_running.keep_running() {
            return Ok(None);
        }
        let index = self.next % total;
        self.next = (index + 1) % total;
        let op = self.ops[index / self.hazards.len()];
        let hazard = self.hazards[index % self.hazards.len()];

        let report = self.run_trial(&op, hazard)?;
        self.observer.inc_counter();
        self.observer.event(&ProbeEvent::TrialCompleted {
            operation: report.operation,
            hazard: report.hazard,
            outcome: report.outcome,
            elapsed: report.elapsed,
        });
        Ok(Some(report))
    }

    /// Repeat the full cross product until cancelled. Returns the trial count.
    pub fn run_loop(&mut self, keep_running: &dyn KeepRunning) -> Result<u64, SandboxError> {
        let mut trials = 0u64;
        while self.run_one_iteration(keep_running)?.is_some() {
            trials += 1;
        }
        Ok(trials)
    }

    /// Run [`run_loop`](Self::run_loop) in a forked, OOM-preferred wrapper process.
    ///
    /// A wrapper killed with `SIGKILL` is treated as an OOM kill and handled per
    /// `policy`. `keep_running` must stay meaningful across `fork`, e.g. a deadline
    /// or a counter in shared memory.
    pub fn run_supervised(
        &mut self,
        policy: OomPolicy,
        keep_running: &dyn KeepRunning,
        adjuster: &dyn OomAdjuster,
    ) -> Result<SupervisedOutcome, SandboxError> {
        let mut restarts = 0u32;
        loop {
            if !keep_running.keep_running() {
                return Ok(SupervisedOutcome::Completed { restarts });
            }
            self.observer.flush();
            let Some(pid) = self.fork_wrapper(keep_running)? else {
                return Ok(SupervisedOutcome::Completed { restarts });
            };
            if pid == 0 {
                self.wrapper_main(keep_running, adjuster);
            }

            let status = wait_retrying(pid)?;
            if libc::WIFSIGNALED(status) && libc::WTERMSIG(status) == libc::SIGKILL {
                let memory = MemoryInfo::sample();
                if !policy.restarts() {
                    self.observer
                        .event(&ProbeEvent::WrapperOomStopped { memory });
                    return Ok(SupervisedOutcome::OomStopped { restarts });
                }
                restarts += 1;
                self.observer
                    .event(&ProbeEvent::WrapperRestarted { restarts, memory });
                continue;
            }
            if libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0 {
                return Ok(SupervisedOutcome::Completed { restarts });
            }
            return Err(SandboxError::Wrapper(status));
        }
    }

    fn fork_wrapper(&self, keep_running: &dyn KeepRunning) -> Result<Option<pid_t>, SandboxError> {
        loop {
            // SAFETY: the wrapper child runs ordinary Rust code and exits with `_exit`.
            let pid = unsafe { libc::fork() };
            if pid >= 0 {
                return Ok(Some(pid));
            }
            let errno = last_errno();
            if errno != libc::EAGAIN {
                return Err(SandboxError::Fork(errno));
            }
            self.observer.event(&ProbeEvent::WrapperForkRetry { errno });
            if !keep_running.keep_running() {
                return Ok(None);
            }
            std::thread::sleep(FORK_RETRY_DELAY);
        }
    }

    fn wrapper_main(&mut self, keep_running: &dyn KeepRunning, adjuster: &dyn OomAdjuster) -> ! {
        // SAFETY: process-control syscalls on the wrapper itself.
        unsafe {
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong);
            if self.ctx.pgrp > 0 {
                libc::setpgid(0, self.ctx.pgrp);
            }
        }
        adjuster.make_oom_preferred();
        let code = match self.run_loop(keep_running) {
            Ok(_) => 0,
            Err(err) if err.is_resource_exhaustion() => WRAPPER_NO_RESOURCE,
            Err(_) => 1,
        };
        self.observer.flush();
        // SAFETY: skip the parent's destructors and atexit handlers.
        unsafe { libc::_exit(code) }
    }
}

fn cpu_time(usage: &libc::rusage) -> Duration {
    let span = |tv: libc::timeval| {
        Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
    };
    span(usage.ru_utime) + span(usage.ru_stime)
}

/// Wait for a trial child. An interrupted wait kills the child and counts as a timeout.
fn reap(pid: pid_t) -> Result<ChildOutcome, SandboxError> {
    let mut status = 0;
    // SAFETY: a zeroed rusage is a valid out-parameter.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    // SAFETY: pid is our child; status and usage are valid out-pointers.
    if unsafe { libc::wait4(pid, &mut status, 0, &mut usage) } == pid {
        return Ok(classify_trial(status, cpu_time(&usage)));
    }
    let errno = last_errno();
    if errno != libc::EINTR {
        return Err(SandboxError::Wait { pid, errno });
    }
    // SAFETY: as above.
    unsafe { libc::kill(pid, libc::SIGKILL) };
    wait_retrying(pid)?;
    Ok(ChildOutcome::TimedOut)
}

fn wait_retrying(pid: pid_t) -> Result<i32, SandboxError> {
    let mut status = 0;
    loop {
        // SAFETY: pid is our child; status is a valid out-pointer.
        if unsafe { libc::waitpid(pid, &mut status, 0) } == pid {
            return Ok(status);
        }
        let errno = last_errno();
        if errno != libc::EINTR {
            return Err(SandboxError::Wait { pid, errno });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_labels() {
        assert_eq!(ChildOutcome::Success.label(), "success");
        assert_eq!(ChildOutcome::ErrnoValue(14).label(), "errno");
        assert_eq!(ChildOutcome::TimedOut.label(), "timed_out");
    }

    #[test]
    fn memory_info_is_plausible() {
        let info = MemoryInfo::sample().expect("sysinfo");
        assert!(info.total_ram > 0);
        assert!(info.free_ram <= info.total_ram);
    }

    #[test]
    fn cpu_time_sums_user_and_system() {
        // SAFETY: rusage is plain old data.
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        usage.ru_utime.tv_sec = 1;
        usage.ru_stime.tv_usec = 250_000;
        assert_eq!(cpu_time(&usage), Duration::from_millis(1250));
    }

    #[test]
    fn exhaustion_classification() {
        assert!(SandboxError::Fork(libc::EAGAIN).is_resource_exhaustion());
        assert!(SandboxError::Wrapper(WRAPPER_NO_RESOURCE << 8).is_resource_exhaustion());
        assert!(!SandboxError::Wrapper(1 << 8).is_resource_exhaustion());
        assert!(!SandboxError::Wrapper(libc::SIGSEGV).is_resource_exhaustion());
    }

    #[test]
    fn empty_tables_yield_nothing() {
        let flag = std::sync::atomic::AtomicBool::new(true);
        let mut sandbox = FaultSandbox::new(
            SandboxContext::current(),
            Vec::new(),
            AddressHazard::ALL.to_vec(),
            Arc::new(crate::control::NullObserver),
        )
        .expect("sandbox");
        assert_eq!(sandbox.trials_per_pass(), 0);
        assert_eq!(sandbox.run_one_iteration(&flag).expect("iteration"), None);
    }
}
