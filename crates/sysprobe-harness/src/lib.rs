//! Stress harness for sysprobe.
//!
//! This crate provides:
//! - Run configuration: a JSON file plus command-line overrides
//! - Structured JSONL logging of core events, with schema validation
//! - The runner: shared heap setup, stressor scheduling, teardown diagnostics

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod runner;
pub mod structured_log;

pub use config::{Overrides, RunConfig};
pub use error::{EXIT_FAILURE, EXIT_NO_RESOURCE, EXIT_OK, HarnessError};
pub use runner::{LogObserver, RunStatus, RunSummary, Stressor, run_badaddr, run_walk};
pub use structured_log::{LogEmitter, LogEntry, LogLevel};
