//! Kernel log drain.
//!
//! Probing sysfs can make drivers spew into the kernel ring buffer. The walker
//! reads the log source after every published target; a non-empty read is a burst,
//! and workers back off briefly so the log can settle.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// Default log source.
pub const KMSG_PATH: &str = "/dev/kmsg";

/// Upper bound on records consumed per call.
const MAX_READS: usize = 1024;
/// `/dev/kmsg` rejects reads shorter than one record.
const RECORD_BUF: usize = 8192;

/// Non-blocking reader that discards whatever the source produces.
#[derive(Debug)]
pub struct LogDrain {
    file: Option<File>,
    buf: Vec<u8>,
}

impl LogDrain {
    /// Open `path` non-blocking. An unreadable source yields a disabled drain.
    #[must_use]
    pub fn open(path: &Path) -> Self {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .ok();
        Self {
            file,
            buf: vec![0; RECORD_BUF],
        }
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self {
            file: None,
            buf: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.file.is_some()
    }

    /// Consume everything currently readable. Returns the bytes discarded.
    pub fn drain(&mut self) -> usize {
        let Some(file) = self.file.as_mut() else {
            return 0;
        };
        let mut total = 0;
        for _ in 0..MAX_READS {
            match file.read(&mut self.buf) {
                Ok(0) => break,
                Ok(n) => total += n,
                // records overwritten before we read them
                Err(err) if err.raw_os_error() == Some(libc::EPIPE) => {}
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
        total
    }
}
