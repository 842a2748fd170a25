//! Runtime policy configuration.
//!
//! The OOM policy is set via the `SYSPROBE_OOM_POLICY` environment variable:
//! - `restart` (default): a supervised wrapper killed by the OOM killer is forked
//!   again and the trial loop resumes.
//! - `stop`: an OOM kill ends the supervised run gracefully.

use std::sync::atomic::{AtomicU8, Ordering};

/// Environment variable consulted by [`oom_policy`].
pub const OOM_POLICY_ENV: &str = "SYSPROBE_OOM_POLICY";

/// What a supervisor does when its wrapper process is OOM-killed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OomPolicy {
    /// End the run.
    Stop,
    /// Fork a fresh wrapper and keep going.
    #[default]
    Restart,
}

impl OomPolicy {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stop" | "oomable" | "exit" => Self::Stop,
            _ => Self::Restart,
        }
    }

    #[must_use]
    pub const fn restarts(self) -> bool {
        matches!(self, Self::Restart)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Restart => "restart",
        }
    }
}

// 0=unresolved, 1=Stop, 2=Restart, 255=resolving.
static CACHED_POLICY: AtomicU8 = AtomicU8::new(0);

const POLICY_UNRESOLVED: u8 = 0;
const POLICY_STOP: u8 = 1;
const POLICY_RESTART: u8 = 2;
const POLICY_RESOLVING: u8 = 255;

fn policy_to_u8(policy: OomPolicy) -> u8 {
    match policy {
        OomPolicy::Stop => POLICY_STOP,
        OomPolicy::Restart => POLICY_RESTART,
    }
}

fn u8_to_policy(v: u8) -> OomPolicy {
    match v {
        POLICY_STOP => OomPolicy::Stop,
        _ => OomPolicy::Restart,
    }
}

/// Configured OOM policy (reads the environment on first call, caches thereafter).
///
/// A concurrent caller that races the first resolution gets the default.
#[must_use]
pub fn oom_policy() -> OomPolicy {
    let cached = CACHED_POLICY.load(Ordering::Relaxed);
    if cached != POLICY_UNRESOLVED && cached != POLICY_RESOLVING {
        return u8_to_policy(cached);
    }
    if cached == POLICY_RESOLVING {
        return OomPolicy::default();
    }

    if CACHED_POLICY
        .compare_exchange(
            POLICY_UNRESOLVED,
            POLICY_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        let v = CACHED_POLICY.load(Ordering::Relaxed);
        return if v != POLICY_UNRESOLVED && v != POLICY_RESOLVING {
            u8_to_policy(v)
        } else {
            OomPolicy::default()
        };
    }

    let policy = std::env::var(OOM_POLICY_ENV)
        .map(|v| OomPolicy::from_str_loose(&v))
        .unwrap_or_default();
    CACHED_POLICY.store(policy_to_u8(policy), Ordering::Release);
    policy
}
