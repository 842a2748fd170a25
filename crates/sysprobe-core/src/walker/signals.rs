//! RAII signal disposition swaps.

use libc::c_int;

/// A handler installed over a previous disposition, restored on drop.
pub(crate) struct InstalledHandler {
    signo: c_int,
    previous: libc::sigaction,
}

impl InstalledHandler {
    /// Install `handler` for `signo` with `flags`. `SA_RESTART` is never added.
    pub(crate) fn install(
        signo: c_int,
        handler: libc::sighandler_t,
        flags: c_int,
    ) -> Result<Self, i32> {
        // SAFETY: zeroed sigaction structs are valid; both pointers are live.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handler;
            action.sa_flags = flags;
            libc::sigemptyset(&mut action.sa_mask);
            let mut previous: libc::sigaction = std::mem::zeroed();
            if libc::sigaction(signo, &action, &mut previous) != 0 {
                return Err(crate::sandbox::last_errno());
            }
            Ok(Self { signo, previous })
        }
    }

    /// Leave the handler in place for the rest of the process.
    pub(crate) fn leak(self) {
        std::mem::forget(self);
    }
}

impl Drop for InstalledHandler {
    fn drop(&mut self) {
        // SAFETY: restoring a disposition previously returned by the kernel.
        unsafe { libc::sigaction(self.signo, &self.previous, std::ptr::null_mut()) };
    }
}

extern "C" fn ignore_signal(_sig: c_int) {}

/// No-op handler without `SA_RESTART`, so delivery interrupts blocking calls.
pub(crate) fn install_unblock_handler(signo: c_int) -> Result<InstalledHandler, i32> {
    InstalledHandler::install(
        signo,
        ignore_signal as extern "C" fn(c_int) as libc::sighandler_t,
        0,
    )
}
