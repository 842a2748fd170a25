//! Table of system calls exercised with hazardous pointers.
//!
//! Every entry runs inside a forked child after `fork`, so none of them may
//! allocate. Each returns `-1` with `errno` set on failure and `0` otherwise.
//!
//! The entries are deliberately unsound in-process: they pass arbitrary addresses
//! to the kernel. Callers reach them only through [`Operation::invoke`].

use std::fmt;
use std::ptr;

use libc::{c_char, c_int, c_void};

/// Arguments available to an operation.
#[derive(Debug, Clone, Copy)]
pub struct HazardArgs {
    /// The hazardous address under test.
    pub addr: *mut c_void,
    /// A valid read-only page, for calls that need one sane pointer.
    pub ro_page: *mut c_void,
    pub page_size: usize,
}

/// One named system call taking a hazardous address.
#[derive(Clone, Copy)]
pub struct Operation {
    pub name: &'static str,
    call: unsafe fn(&HazardArgs) -> c_int,
}

impl Operation {
    #[must_use]
    pub const fn new(name: &'static str, call: unsafe fn(&HazardArgs) -> c_int) -> Self {
        Self { name, call }
    }

    /// Invoke the call.
    ///
    /// # Safety
    ///
    /// The call may write through `args.addr`. Only run it in a sacrificial process.
    pub unsafe fn invoke(&self, args: &HazardArgs) -> c_int {
        // SAFETY: forwarded to caller.
        unsafe { (self.call)(args) }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Operation").field(&self.name).finish()
    }
}

fn status(ret: isize) -> c_int {
    if ret < 0 { -1 } else { 0 }
}

unsafe fn bad_access(a: &HazardArgs) -> c_int {
    unsafe { libc::access(a.addr as *const c_char, libc::R_OK) }
}

unsafe fn bad_clock_gettime(a: &HazardArgs) -> c_int {
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, a.addr.cast()) }
}

unsafe fn bad_execve(a: &HazardArgs) -> c_int {
    unsafe {
        libc::execve(
            a.addr as *const c_char,
            a.addr as *const *const c_char,
            a.addr as *const *const c_char,
        )
    }
}

unsafe fn bad_getcwd(a: &HazardArgs) -> c_int {
    if unsafe { libc::getcwd(a.addr.cast(), a.page_size) }.is_null() {
        -1
    } else {
        0
    }
}

unsafe fn bad_getrandom(a: &HazardArgs) -> c_int {
    status(unsafe { libc::getrandom(a.addr, 1024, 0) })
}

unsafe fn bad_getresgid(a: &HazardArgs) -> c_int {
    unsafe { libc::getresgid(a.addr.cast(), a.addr.cast(), a.addr.cast()) }
}

unsafe fn bad_getresuid(a: &HazardArgs) -> c_int {
    unsafe { libc::getresuid(a.addr.cast(), a.addr.cast(), a.addr.cast()) }
}

unsafe fn bad_getrlimit(a: &HazardArgs) -> c_int {
    unsafe { libc::getrlimit(libc::RLIMIT_CPU, a.addr.cast()) }
}

unsafe fn bad_getrusage(a: &HazardArgs) -> c_int {
    unsafe { libc::getrusage(libc::RUSAGE_CHILDREN, a.addr.cast()) }
}

unsafe fn bad_gettimeofday(a: &HazardArgs) -> c_int {
    unsafe { libc::gettimeofday(a.addr.cast(), ptr::null_mut()) }
}

unsafe fn bad_ioctl(a: &HazardArgs) -> c_int {
    unsafe { libc::ioctl(0, libc::TCGETS, a.addr) }
}

unsafe fn bad_mincore(a: &HazardArgs) -> c_int {
    unsafe { libc::mincore(a.ro_page, 1, a.addr.cast()) }
}

unsafe fn bad_nanosleep(a: &HazardArgs) -> c_int {
    unsafe { libc::nanosleep(a.addr as *const libc::timespec, a.addr.cast()) }
}

unsafe fn bad_open(a: &HazardArgs) -> c_int {
    let fd = unsafe { libc::open(a.addr as *const c_char, libc::O_RDONLY) };
    if fd < 0 {
        return -1;
    }
    unsafe { libc::close(fd) };
    0
}

unsafe fn bad_pipe(a: &HazardArgs) -> c_int {
    unsafe { libc::pipe(a.addr.cast()) }
}

unsafe fn bad_poll(a: &HazardArgs) -> c_int {
    unsafe { libc::poll(a.addr.cast(), 1, 0) }
}

unsafe fn bad_read(a: &HazardArgs) -> c_int {
    let fd = unsafe { libc::open(c"/dev/zero".as_ptr(), libc::O_RDONLY) };
    if fd < 0 {
        return -1;
    }
    let ret = unsafe { libc::read(fd, a.addr, 1024) };
    let saved = std::io::Error::last_os_error();
    unsafe { libc::close(fd) };
    restore_errno(ret, saved)
}

unsafe fn bad_readv(a: &HazardArgs) -> c_int {
    let fd = unsafe { libc::open(c"/dev/zero".as_ptr(), libc::O_RDONLY) };
    if fd < 0 {
        return -1;
    }
    let ret = unsafe { libc::readv(fd, a.addr as *const libc::iovec, 1) };
    let saved = std::io::Error::last_os_error();
    unsafe { libc::close(fd) };
    restore_errno(ret, saved)
}

unsafe fn bad_select(a: &HazardArgs) -> c_int {
    unsafe { libc::select(1, a.addr.cast(), a.addr.cast(), a.addr.cast(), a.addr.cast()) }
}

unsafe fn bad_stat(a: &HazardArgs) -> c_int {
    unsafe { libc::stat(a.addr as *const c_char, a.addr.cast()) }
}

unsafe fn bad_statfs(a: &HazardArgs) -> c_int {
    unsafe { libc::statfs(c".".as_ptr(), a.addr.cast()) }
}

unsafe fn bad_sysinfo(a: &HazardArgs) -> c_int {
    unsafe { libc::sysinfo(a.addr.cast()) }
}

unsafe fn bad_time(a: &HazardArgs) -> c_int {
    status(unsafe { libc::time(a.addr.cast()) } as isize)
}

unsafe fn bad_times(a: &HazardArgs) -> c_int {
    status(unsafe { libc::times(a.addr.cast()) } as isize)
}

unsafe fn bad_utime(a: &HazardArgs) -> c_int {
    unsafe { libc::utime(a.addr as *const c_char, a.addr as *const libc::utimbuf) }
}

unsafe fn bad_wait(a: &HazardArgs) -> c_int {
    status(unsafe { libc::wait(a.addr.cast()) } as isize)
}

unsafe fn bad_waitpid(a: &HazardArgs) -> c_int {
    status(unsafe { libc::waitpid(libc::getpid(), a.addr.cast(), 0) } as isize)
}

unsafe fn bad_write(a: &HazardArgs) -> c_int {
    let fd = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY) };
    if fd < 0 {
        return -1;
    }
    let ret = unsafe { libc::write(fd, a.addr, 1024) };
    let saved = std::io::Error::last_os_error();
    unsafe { libc::close(fd) };
    restore_errno(ret, saved)
}

unsafe fn bad_writev(a: &HazardArgs) -> c_int {
    let fd = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY) };
    if fd < 0 {
        return -1;
    }
    let ret = unsafe { libc::writev(fd, a.addr as *const libc::iovec, 1) };
    let saved = std::io::Error::last_os_error();
    unsafe { libc::close(fd) };
    restore_errno(ret, saved)
}

/// `close` may clobber errno from the call under test.
fn restore_errno(ret: isize, saved: std::io::Error) -> c_int {
    if ret >= 0 {
        return 0;
    }
    if let Some(errno) = saved.raw_os_error() {
        // SAFETY: errno is thread-local and always addressable.
        unsafe { *libc::__errno_location() = errno };
    }
    -1
}

/// Every built-in operation, in execution order.
pub static OPERATIONS: &[Operation] = &[
    Operation::new("access", bad_access),
    Operation::new("clock_gettime", bad_clock_gettime),
    Operation::new("execve", bad_execve),
    Operation::new("getcwd", bad_getcwd),
    Operation::new("getrandom", bad_getrandom),
    Operation::new("getresgid", bad_getresgid),
    Operation::new("getresuid", bad_getresuid),
    Operation::new("getrlimit", bad_getrlimit),
    Operation::new("getrusage", bad_getrusage),
    Operation::new("gettimeofday", bad_gettimeofday),
    Operation::new("ioctl", bad_ioctl),
    Operation::new("mincore", bad_mincore),
    Operation::new("nanosleep", bad_nanosleep),
    Operation::new("open", bad_open),
    Operation::new("pipe", bad_pipe),
    Operation::new("poll", bad_poll),
    Operation::new("read", bad_read),
    Operation::new("readv", bad_readv),
    Operation::new("select", bad_select),
    Operation::new("stat", bad_stat),
    Operation::new("statfs", bad_statfs),
    Operation::new("sysinfo", bad_sysinfo),
    Operation::new("time", bad_time),
    Operation::new("times", bad_times),
    Operation::new("utime", bad_utime),
    Operation::new("wait", bad_wait),
    Operation::new("waitpid", bad_waitpid),
    Operation::new("write", bad_write),
    Operation::new("writev", bad_writev),
];

#[must_use]
pub fn find_operation(name: &str) -> Option<Operation> {
    OPERATIONS.iter().copied().find(|op| op.name == name)
}

/// Operations whose names appear in `names`, in table order. An empty filter
/// selects everything. Unknown names are returned in the error.
pub fn select_operations<S: AsRef<str>>(names: &[S]) -> Result<Vec<Operation>, Vec<String>> {
    if names.is_empty() {
        return Ok(OPERATIONS.to_vec());
    }
    let unknown: Vec<String> = names
        .iter()
        .map(AsRef::as_ref)
        .filter(|n| find_operation(n).is_none())
        .map(str::to_owned)
        .collect();
    if !unknown.is_empty() {
        return Err(unknown);
    }
    Ok(OPERATIONS
        .iter()
        .copied()
        .filter(|op| names.iter().any(|n| n.as_ref() == op.name))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn table_names_are_unique_and_sorted() {
        let names: Vec<&str> = OPERATIONS.iter().map(|op| op.name).collect();
        let unique: HashSet<&str> = names.iter().copied().collect();
        assert_eq!(unique.len(), names.len());
        let mut sorted = names.clone();
        sorted.sort_unstable();
        assert_eq!(names, sorted);
        assert_eq!(names.len(), 29);
    }

    #[test]
    fn select_filters_in_table_order() {
        let picked = select_operations(&["write", "read"]).expect("known names");
        let names: Vec<&str> = picked.iter().map(|op| op.name).collect();
        assert_eq!(names, vec!["read", "write"]);
        assert_eq!(select_operations::<&str>(&[]).expect("all").len(), OPERATIONS.len());
    }

    #[test]
    fn select_reports_unknown_names() {
        let err = select_operations(&["read", "frobnicate"]).expect_err("unknown");
        assert_eq!(err, vec!["frobnicate".to_string()]);
    }

    #[test]
    fn read_with_valid_buffer_succeeds_in_process() {
        let mut buf = [0xffu8; 1024];
        let args = HazardArgs {
            addr: buf.as_mut_ptr().cast(),
            ro_page: ptr::null_mut(),
            page_size: 4096,
        };
        let op = find_operation("read").expect("read op");
        // SAFETY: addr is a writable 1024-byte buffer.
        assert_eq!(unsafe { op.invoke(&args) }, 0);
        assert!(buf.iter().all(|b| *b == 0));
    }
}
