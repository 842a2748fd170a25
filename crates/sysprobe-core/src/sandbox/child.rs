//! The trial child: everything between `fork` and `_exit`.
//!
//! Only async-signal-safe calls are made here. The child's exit status encodes the
//! result so the parent can classify it without any other channel:
//!
//! | status                      | meaning                                   |
//! |-----------------------------|-------------------------------------------|
//! | `0`                         | the call succeeded                        |
//! | `1..FAULT_STATUS_BASE`      | the call (or setup) failed with that errno |
//! | `FAULT_STATUS_BASE + sig`   | a fatal signal was caught                 |
//! | `FAULT_STATUS_BASE + ALRM`  | the watchdog fired                        |

use std::time::Duration;

use libc::{c_int, pid_t};
use sysprobe_shm::InheritedMapping;

use super::ChildOutcome;
use super::ops::{HazardArgs, Operation};

/// Exit status offset for caught fatal signals. Above every errno value.
pub const FAULT_STATUS_BASE: c_int = 192;

/// Trial CPU-time limit. The kernel SIGKILLs a child that reaches it.
pub const CPU_LIMIT_SECS: libc::rlim_t = 1;

/// Watchdog period.
pub const WATCHDOG_USEC: libc::suseconds_t = 100_000;

/// Signals that end a trial with a fixed per-signal status.
pub const FATAL_SIGNALS: [c_int; 9] = [
    libc::SIGILL,
    libc::SIGTRAP,
    libc::SIGFPE,
    libc::SIGBUS,
    libc::SIGSEGV,
    libc::SIGABRT,
    libc::SIGINT,
    libc::SIGHUP,
    libc::SIGALRM,
];

const NOBODY: libc::uid_t = 65534;

pub(crate) struct ChildPlan {
    pub(crate) op: Operation,
    pub(crate) args: HazardArgs,
    pub(crate) pgrp: pid_t,
    pub(crate) parent: pid_t,
    pub(crate) heap: Option<InheritedMapping>,
}

extern "C" fn fatal_handler(sig: c_int) {
    // SAFETY: _exit is async-signal-safe.
    unsafe { libc::_exit(FAULT_STATUS_BASE + sig) }
}

fn errno() -> c_int {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EINVAL)
}

/// Exit with the current errno, never 0.
fn fail() -> ! {
    let e = errno();
    // SAFETY: _exit never returns and runs no destructors.
    unsafe { libc::_exit(if e > 0 && e < FAULT_STATUS_BASE { e } else { libc::EINVAL }) }
}

/// At most one second of CPU and two processes. Failures keep the old limits.
fn restrict_limits() {
    let cpu = libc::rlimit {
        rlim_cur: CPU_LIMIT_SECS,
        rlim_max: CPU_LIMIT_SECS,
    };
    let nproc = libc::rlimit {
        rlim_cur: 2,
        rlim_max: 2,
    };
    // SAFETY: both are valid rlimit values.
    unsafe {
        libc::setrlimit(libc::RLIMIT_CPU, &cpu);
        libc::setrlimit(libc::RLIMIT_NPROC, &nproc);
    }
}

/// Give up root, if we have it. Refuses to continue if that fails.
fn drop_privilege() {
    // SAFETY: plain credential syscalls on the calling process.
    unsafe {
        let zero: libc::c_ulong = 0;
        libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1 as libc::c_ulong, zero, zero, zero);
        if libc::geteuid() != 0 {
            return;
        }
        if libc::setgroups(0, std::ptr::null()) != 0
            || libc::setresgid(NOBODY, NOBODY, NOBODY) != 0
            || libc::setresuid(NOBODY, NOBODY, NOBODY) != 0
        {
            fail();
        }
    }
}

fn install_fatal_handlers() {
    for sig in FATAL_SIGNALS {
        // SAFETY: a zeroed sigaction with an empty mask and a plain handler is valid.
        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = fatal_handler as extern "C" fn(c_int) as libc::sighandler_t;
            libc::sigemptyset(&mut sa.sa_mask);
            if libc::sigaction(sig, &sa, std::ptr::null_mut()) != 0 {
                fail();
            }
        }
    }
}

fn arm_watchdog() {
    let period = libc::timeval {
        tv_sec: 0,
        tv_usec: WATCHDOG_USEC,
    };
    let timer = libc::itimerval {
        it_interval: period,
        it_value: period,
    };
    // SAFETY: timer is a valid itimerval.
    if unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, std::ptr::null_mut()) } != 0 {
        fail();
    }
}

/// Run one trial in the freshly forked child. Never returns.
pub(crate) fn run(plan: &ChildPlan) -> ! {
    if let Some(heap) = plan.heap {
        // SAFETY: this process never touches the heap after this point.
        unsafe { heap.unmap() };
    }

    restrict_limits();
    drop_privilege();
    install_fatal_handlers();

    // SAFETY: plain process-control syscalls.
    unsafe {
        if plan.pgrp > 0 {
            libc::setpgid(0, plan.pgrp);
        }
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong);
        if libc::getppid() != plan.parent {
            libc::_exit(libc::ESRCH);
        }
    }

    arm_watchdog();

    // SAFETY: this process is sacrificial; any damage ends with it.
    let ret = unsafe { plan.op.invoke(&plan.args) };
    let code = if ret < 0 {
        let e = errno();
        if e > 0 && e < FAULT_STATUS_BASE { e } else { libc::EINVAL }
    } else {
        0
    };
    // SAFETY: see `fail`.
    unsafe { libc::_exit(code) }
}

/// Classify a reaped trial child given the CPU time it consumed.
///
/// A raw `SIGKILL` is either the OOM killer or the `RLIMIT_CPU` hard limit; a child
/// that used up its CPU allowance was a hang the watchdog did not catch.
#[must_use]
pub fn classify_trial(status: c_int, cpu_time: Duration) -> ChildOutcome {
    match classify(status) {
        ChildOutcome::OomKilled if cpu_time >= Duration::from_secs(CPU_LIMIT_SECS) => {
            ChildOutcome::TimedOut
        }
        outcome => outcome,
    }
}

/// Map a `waitpid` status to an outcome.
#[must_use]
pub fn classify(status: c_int) -> ChildOutcome {
    if libc::WIFSIGNALED(status) {
        return match libc::WTERMSIG(status) {
            libc::SIGKILL => ChildOutcome::OomKilled,
            sig => ChildOutcome::Signaled(sig),
        };
    }
    if !libc::WIFEXITED(status) {
        return ChildOutcome::Signaled(0);
    }
    match libc::WEXITSTATUS(status) {
        0 => ChildOutcome::Success,
        code if code == FAULT_STATUS_BASE + libc::SIGALRM => ChildOutcome::TimedOut,
        code if code > FAULT_STATUS_BASE && code <= FAULT_STATUS_BASE + 31 => {
            ChildOutcome::Signaled(code - FAULT_STATUS_BASE)
        }
        errno => ChildOutcome::ErrnoValue(errno),
    }
}
