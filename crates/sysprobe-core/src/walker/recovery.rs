//! Process-wide segmentation fault recovery point.
//!
//! There is exactly one recovery point per process. While armed, a `SIGSEGV` on any
//! thread trips it: the handler records the faulting thread and address, then parks
//! that thread in `pause()` for good. The supervising thread notices the trip,
//! abandons the parked thread and reports the run as aborted.
//!
//! A second fault while tripped (or any fault while disarmed) restores the default
//! disposition and re-raises, terminating the process.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicUsize, Ordering};

use libc::c_int;

use super::WalkerError;
use super::signals::InstalledHandler;

const DISARMED: u8 = 0;
const ARMED: u8 = 1;
const TRIPPED: u8 = 2;

static STATE: AtomicU8 = AtomicU8::new(DISARMED);
static CLAIMED: AtomicBool = AtomicBool::new(false);
static RECORDED: AtomicBool = AtomicBool::new(false);
static FAULT_SIGNAL: AtomicI32 = AtomicI32::new(0);
static FAULT_ADDR: AtomicUsize = AtomicUsize::new(0);
static FAULT_THREAD: AtomicUsize = AtomicUsize::new(0);

/// Serialises tests that arm the recovery point.
#[cfg(test)]
pub(crate) static TEST_SERIAL: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

/// What tripped the recovery point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultInfo {
    pub signal: i32,
    /// `si_addr` of the fault; meaningless for synthetic signals.
    pub addr: usize,
    /// `pthread_t` of the parked thread.
    pub thread: usize,
}

extern "C" fn on_fault(sig: c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    if STATE
        .compare_exchange(ARMED, TRIPPED, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        // SAFETY: the kernel passes a valid siginfo for SA_SIGINFO handlers.
        let addr = if info.is_null() {
            0
        } else {
            unsafe { (*info).si_addr() as usize }
        };
        FAULT_SIGNAL.store(sig, Ordering::Relaxed);
        FAULT_ADDR.store(addr, Ordering::Relaxed);
        // SAFETY: pthread_self is async-signal-safe in practice and never fails.
        FAULT_THREAD.store(unsafe { libc::pthread_self() } as usize, Ordering::Relaxed);
        RECORDED.store(true, Ordering::Release);
        loop {
            // SAFETY: pause only suspends this thread.
            unsafe { libc::pause() };
        }
    }

    // SAFETY: resetting a disposition and raising are async-signal-safe.
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
}

/// True while the current run's recovery point has been tripped.
#[must_use]
pub fn is_tripped() -> bool {
    STATE.load(Ordering::Acquire) == TRIPPED
}

/// Exclusive ownership of the armed recovery point. Disarms and restores the
/// previous `SIGSEGV` disposition on drop.
pub struct RecoveryPoint {
    handler: Option<InstalledHandler>,
}

impl RecoveryPoint {
    /// Claim and arm the recovery point.
    pub fn arm() -> Result<Self, WalkerError> {
        if CLAIMED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(WalkerError::RecoveryBusy);
        }
        RECORDED.store(false, Ordering::Relaxed);
        FAULT_SIGNAL.store(0, Ordering::Relaxed);
        FAULT_ADDR.store(0, Ordering::Relaxed);
        FAULT_THREAD.store(0, Ordering::Relaxed);
        STATE.store(ARMED, Ordering::SeqCst);

        let handler = on_fault
            as extern "C" fn(c_int, *mut libc::siginfo_t, *mut libc::c_void)
            as libc::sighandler_t;
        match InstalledHandler::install(
            libc::SIGSEGV,
            handler,
            libc::SA_SIGINFO | libc::SA_ONSTACK,
        ) {
            Ok(installed) => Ok(Self {
                handler: Some(installed),
            }),
            Err(errno) => {
                STATE.store(DISARMED, Ordering::SeqCst);
                CLAIMED.store(false, Ordering::Release);
                Err(WalkerError::Signal(errno))
            }
        }
    }

    #[must_use]
    pub fn is_tripped(&self) -> bool {
        is_tripped()
    }

    /// Details of the trip, once the handler has recorded them.
    #[must_use]
    pub fn fault(&self) -> Option<FaultInfo> {
        if !RECORDED.load(Ordering::Acquire) {
            return None;
        }
        Some(FaultInfo {
            signal: FAULT_SIGNAL.load(Ordering::Relaxed),
            addr: FAULT_ADDR.load(Ordering::Relaxed),
            thread: FAULT_THREAD.load(Ordering::Relaxed),
        })
    }
}

impl Drop for RecoveryPoint {
    fn drop(&mut self) {
        STATE.store(DISARMED, Ordering::SeqCst);
        drop(self.handler.take());
        CLAIMED.store(false, Ordering::Release);
    }
}
