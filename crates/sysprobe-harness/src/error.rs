//! Harness error type and exit-code mapping.

use std::path::PathBuf;

use sysprobe_core::{SandboxError, WalkerError};
use sysprobe_shm::HeapError;
use thiserror::Error;

/// Exit status for a successful run.
pub const EXIT_OK: i32 = 0;
/// Exit status for a failed or aborted run.
pub const EXIT_FAILURE: i32 = 1;
/// Exit status when the system ran out of processes or memory.
pub const EXIT_NO_RESOURCE: i32 = 3;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Heap(#[from] HeapError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Walker(#[from] WalkerError),
    #[error("config {}: {message}", path.display())]
    Config { path: PathBuf, message: String },
    #[error("unknown operations: {}", .0.join(", "))]
    UnknownOperations(Vec<String>),
    #[error("unknown hazard '{0}'")]
    UnknownHazard(String),
    #[error("unknown log level '{0}'")]
    UnknownLevel(String),
    #[error("cannot install interrupt handler (errno {0})")]
    Interrupt(i32),
    #[error("log schema violations: {0}")]
    InvalidLog(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl HarnessError {
    /// Process exit status for this error.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        let exhausted = match self {
            Self::Sandbox(err) => err.is_resource_exhaustion(),
            Self::Walker(err) => err.is_resource_exhaustion(),
            Self::Heap(HeapError::MapFailed { errno, .. }) => {
                matches!(*errno, libc::ENOMEM | libc::EAGAIN)
            }
            _ => false,
        };
        if exhausted {
            EXIT_NO_RESOURCE
        } else {
            EXIT_FAILURE
        }
    }
}
