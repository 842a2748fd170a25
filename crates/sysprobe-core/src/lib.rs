//! # sysprobe-core
//!
//! The fault-triggering mechanisms of sysprobe:
//!
//! - [`sandbox`]: one forked, rlimited, watchdogged child per (operation, bad address)
//!   trial, with OOM-aware supervision of the whole loop.
//! - [`walker`]: a producer thread walking a resource tree while a worker pool races
//!   against the published target, with process-wide segfault recovery.
//!
//! Both report through the collaborator traits in [`control`].

pub mod config;
pub mod control;
pub mod rng;
pub mod sandbox;
pub mod walker;

pub use config::{OomPolicy, oom_policy};
pub use control::{
    KeepRunning, NoOomAdjust, NullObserver, OomAdjuster, ProbeEvent, ProbeObserver,
    ProcOomAdjuster, RunBudget, install_interrupt_handler, running_flag,
};
pub use sandbox::{
    AddressHazard, ChildOutcome, FaultSandbox, MemoryInfo, Operation, SandboxContext,
    SandboxError, SupervisedOutcome, TrialReport,
};
pub use walker::{
    ConcurrentWalker, RunHandle, RunOutcome, WalkerConfig, WalkerError, WalkerState,
};
