//! Run configuration: a JSON file, overridden by command-line flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysprobe_core::sandbox::select_operations;
use sysprobe_core::walker::Denylist;
use sysprobe_core::{AddressHazard, OomPolicy, Operation, WalkerConfig, oom_policy};
use sysprobe_shm::HeapConfig;

use crate::error::HarnessError;
use crate::structured_log::LogLevel;

/// Top-level run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Wall-clock limit in seconds; 0 runs until interrupted.
    pub duration_secs: u64,
    /// Stop after this many completed operations; 0 is unlimited.
    pub max_ops: u64,
    /// JSONL log destination; stderr when unset.
    pub log_path: Option<PathBuf>,
    pub log_level: String,
    /// Trace-id run component; derived from pid and start time when unset.
    pub run_id: Option<String>,
    pub heap: HeapSection,
    pub sandbox: SandboxSection,
    pub walker: WalkerSection,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            duration_secs: 60,
            max_ops: 0,
            log_path: None,
            log_level: "info".to_string(),
            run_id: None,
            heap: HeapSection::default(),
            sandbox: SandboxSection::default(),
            walker: WalkerSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeapSection {
    pub expected_strings: usize,
    pub ceiling: usize,
}

impl Default for HeapSection {
    fn default() -> Self {
        let base = HeapConfig::default();
        Self {
            expected_strings: base.expected_strings,
            ceiling: base.ceiling,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxSection {
    /// Operation names to run; empty selects all.
    pub operations: Vec<String>,
    /// Hazard names to run; empty selects all.
    pub hazards: Vec<String>,
    /// Run the trial loop inside an OOM-preferred wrapper process.
    pub supervised: bool,
    /// `stop` or `restart`; falls back to `SYSPROBE_OOM_POLICY`.
    pub oom_policy: Option<String>,
    /// Raise the OOM score of supervised wrappers.
    pub oom_adjust: bool,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            operations: Vec::new(),
            hazards: Vec::new(),
            supervised: true,
            oom_policy: None,
            oom_adjust: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WalkerSection {
    pub root: PathBuf,
    pub workers: usize,
    pub max_depth: usize,
    pub quantum_ms: u64,
    pub target_budget_ms: u64,
    /// Noisy log source drained between targets; `null` disables draining.
    pub drain_source: Option<PathBuf>,
    pub grace_ms: u64,
    /// Extra denylist rules; every fragment of a rule must match.
    pub deny: Vec<Vec<String>>,
    pub oom_adjust: bool,
}

impl Default for WalkerSection {
    fn default() -> Self {
        let base = WalkerConfig::default();
        Self {
            root: PathBuf::from("/sys"),
            workers: base.workers,
            max_depth: base.max_depth,
            quantum_ms: duration_ms(base.quantum),
            target_budget_ms: duration_ms(base.target_budget),
            drain_source: base.drain_source,
            grace_ms: duration_ms(base.grace_period),
            deny: Vec::new(),
            oom_adjust: true,
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl RunConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, HarnessError> {
        let text = std::fs::read_to_string(path).map_err(|e| HarnessError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| HarnessError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        (self.duration_secs > 0).then(|| Duration::from_secs(self.duration_secs))
    }

    pub fn log_level(&self) -> Result<LogLevel, HarnessError> {
        LogLevel::from_name(&self.log_level)
            .ok_or_else(|| HarnessError::UnknownLevel(self.log_level.clone()))
    }

    #[must_use]
    pub fn heap_config(&self) -> HeapConfig {
        HeapConfig {
            expected_strings: self.heap.expected_strings,
            ceiling: self.heap.ceiling,
            ..HeapConfig::default()
        }
    }

    /// Configured policy, or the cached environment policy.
    #[must_use]
    pub fn oom_policy(&self) -> OomPolicy {
        self.sandbox
            .oom_policy
            .as_deref()
            .map_or_else(oom_policy, OomPolicy::from_str_loose)
    }

    pub fn operations(&self) -> Result<Vec<Operation>, HarnessError> {
        select_operations(&self.sandbox.operations).map_err(HarnessError::UnknownOperations)
    }

    pub fn hazards(&self) -> Result<Vec<AddressHazard>, HarnessError> {
        if self.sandbox.hazards.is_empty() {
            return Ok(AddressHazard::ALL.to_vec());
        }
        self.sandbox
            .hazards
            .iter()
            .map(|name| {
                AddressHazard::from_name(name).ok_or_else(|| HarnessError::UnknownHazard(name.clone()))
            })
            .collect()
    }

    #[must_use]
    pub fn walker_config(&self) -> WalkerConfig {
        let w = &self.walker;
        let denylist = w
            .deny
            .iter()
            .fold(Denylist::default(), |list, rule| list.with_rule(rule));
        WalkerConfig {
            workers: w.workers,
            max_depth: w.max_depth,
            quantum: Duration::from_millis(w.quantum_ms),
            target_budget: Duration::from_millis(w.target_budget_ms),
            drain_source: w.drain_source.clone(),
            grace_period: Duration::from_millis(w.grace_ms),
            denylist,
            ..WalkerConfig::default()
        }
    }

    /// Apply command-line overrides on top of the file values.
    pub fn apply(&mut self, overrides: Overrides) {
        let Overrides {
            duration_secs,
            max_ops,
            log_path,
            log_level,
            run_id,
            operations,
            hazards,
            unsupervised,
            oom_policy,
            root,
            workers,
            max_depth,
            no_drain,
        } = overrides;
        if let Some(v) = duration_secs {
            self.duration_secs = v;
        }
        if let Some(v) = max_ops {
            self.max_ops = v;
        }
        if log_path.is_some() {
            self.log_path = log_path;
        }
        if let Some(v) = log_level {
            self.log_level = v;
        }
        if run_id.is_some() {
            self.run_id = run_id;
        }
        if !operations.is_empty() {
            self.sandbox.operations = operations;
        }
        if !hazards.is_empty() {
            self.sandbox.hazards = hazards;
        }
        if unsupervised {
            self.sandbox.supervised = false;
        }
        if oom_policy.is_some() {
            self.sandbox.oom_policy = oom_policy;
        }
        if let Some(v) = root {
            self.walker.root = v;
        }
        if let Some(v) = workers {
            self.walker.workers = v;
        }
        if let Some(v) = max_depth {
            self.walker.max_depth = v;
        }
        if no_drain {
            self.walker.drain_source = None;
        }
    }
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub duration_secs: Option<u64>,
    pub max_ops: Option<u64>,
    pub log_path: Option<PathBuf>,
    pub log_level: Option<String>,
    pub run_id: Option<String>,
    pub operations: Vec<String>,
    pub hazards: Vec<String>,
    pub unsupervised: bool,
    pub oom_policy: Option<String>,
    pub root: Option<PathBuf>,
    pub workers: Option<usize>,
    pub max_depth: Option<usize>,
    pub no_drain: bool,
}
