//! Stressor execution engine.
//!
//! A run maps the shared heap, interns the metric description, drives one stressor
//! until its budget runs out, then logs heap diagnostics and releases the region.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sysprobe_core::{
    AddressHazard, ChildOutcome, ConcurrentWalker, FaultSandbox, KeepRunning, MemoryInfo,
    NoOomAdjust, OomAdjuster, Operation, ProbeEvent, ProbeObserver, ProcOomAdjuster, RunBudget,
    RunOutcome, SandboxContext, SupervisedOutcome,
};
use sysprobe_shm::{CounterSlot, HeapError, HeapUsage, SharedHeap};

use crate::config::RunConfig;
use crate::error::{EXIT_FAILURE, EXIT_OK, HarnessError};
use crate::structured_log::{Component, LogEmitter, LogEntry, LogLevel, Outcome};

/// How often the walk supervisor checks its budget.
const WALK_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stressor {
    /// Hazardous calls with bad addresses in sandboxed children.
    BadAddress,
    /// Concurrent probing of a resource tree.
    Walk,
}

impl Stressor {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::BadAddress => "badaddr",
            Self::Walk => "walk",
        }
    }

    #[must_use]
    pub const fn component(self) -> Component {
        match self {
            Self::BadAddress => Component::Sandbox,
            Self::Walk => Component::Walker,
        }
    }

    /// Description of the progress counter, shared with forked processes.
    #[must_use]
    pub const fn metric_description(self) -> &'static str {
        match self {
            Self::BadAddress => "bad address trials completed",
            Self::Walk => "walker targets published",
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Completed {
        restarts: u32,
    },
    /// The wrapper was OOM-killed and the policy said stop.
    OomStopped {
        restarts: u32,
    },
    /// A walker thread faulted.
    Aborted {
        last_target: Option<PathBuf>,
        fault_addr: usize,
    },
}

impl RunStatus {
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed { .. } | Self::OomStopped { .. } => EXIT_OK,
            Self::Aborted { .. } => EXIT_FAILURE,
        }
    }

    #[must_use]
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::Completed { .. } => Outcome::Success,
            Self::OomStopped { .. } => Outcome::OomStopped,
            Self::Aborted { .. } => Outcome::Aborted,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub stressor: Stressor,
    pub status: RunStatus,
    /// Trials completed or targets published, across all processes.
    pub ops: u64,
    pub elapsed: Duration,
    pub heap: HeapUsage,
}

/// Maps core events to structured log entries and counts progress in the shared
/// heap.
pub struct LogObserver {
    emitter: Mutex<LogEmitter>,
    heap: Arc<SharedHeap>,
    progress: CounterSlot,
    component: Component,
}

impl LogObserver {
    #[must_use]
    pub fn new(
        emitter: LogEmitter,
        heap: Arc<SharedHeap>,
        progress: CounterSlot,
        component: Component,
    ) -> Self {
        Self {
            emitter: Mutex::new(emitter),
            heap,
            progress,
            component,
        }
    }

    #[must_use]
    pub fn progress(&self) -> u64 {
        self.heap
            .counter(self.progress)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Write one entry. Log write failures never stop a run.
    pub fn log(&self, entry: LogEntry) {
        let _ = self.emitter.lock().emit_entry(entry);
    }
}

impl ProbeObserver for LogObserver {
    fn inc_counter(&self) {
        if let Some(counter) = self.heap.counter(self.progress) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn event(&self, event: &ProbeEvent<'_>) {
        let mut emitter = self.emitter.lock();
        if emitter.enabled(event_level(event)) {
            let _ = emitter.emit_entry(event_entry(self.component, event));
        }
    }

    fn flush(&self) {
        let _ = self.emitter.lock().flush();
    }
}

fn trial_outcome(outcome: ChildOutcome) -> Outcome {
    match outcome {
        ChildOutcome::Success => Outcome::Success,
        ChildOutcome::ErrnoValue(_) => Outcome::Errno,
        ChildOutcome::Signaled(_) => Outcome::Signaled,
        ChildOutcome::TimedOut => Outcome::Timeout,
        ChildOutcome::OomKilled => Outcome::OomKilled,
    }
}

fn memory_details(memory: Option<MemoryInfo>) -> serde_json::Value {
    memory.map_or(serde_json::Value::Null, |m| {
        serde_json::json!({
            "total_ram": m.total_ram,
            "free_ram": m.free_ram,
            "free_swap": m.free_swap,
        })
    })
}

/// Severity of a core event.
#[must_use]
pub fn event_level(event: &ProbeEvent<'_>) -> LogLevel {
    match event {
        ProbeEvent::TrialCompleted { outcome, .. } => match outcome {
            ChildOutcome::Success | ChildOutcome::ErrnoValue(_) => LogLevel::Debug,
            ChildOutcome::TimedOut => LogLevel::Info,
            ChildOutcome::Signaled(_) | ChildOutcome::OomKilled => LogLevel::Warn,
        },
        ProbeEvent::TargetPublished { .. } => LogLevel::Trace,
        ProbeEvent::DrainBurst { .. } => LogLevel::Debug,
        ProbeEvent::WrapperForkRetry { .. }
        | ProbeEvent::WrapperRestarted { .. }
        | ProbeEvent::SlowTarget { .. }
        | ProbeEvent::CursorLockTimeout { .. } => LogLevel::Warn,
        ProbeEvent::WrapperOomStopped { .. }
        | ProbeEvent::WorkersAbandoned { .. }
        | ProbeEvent::WalkerAborted { .. }
        | ProbeEvent::TransitionRejected { .. } => LogLevel::Error,
    }
}

/// Structured log entry for a core event; the emitter assigns the trace id.
#[must_use]
pub fn event_entry(component: Component, event: &ProbeEvent<'_>) -> LogEntry {
    let entry = LogEntry::event(event_level(event), event.name()).with_component(component);
    match event {
        ProbeEvent::TrialCompleted {
            operation,
            hazard,
            outcome,
            elapsed,
        } => {
            let entry = entry
                .with_trial(*operation, hazard.name())
                .with_outcome(trial_outcome(*outcome))
                .with_latency_ns(u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX));
            match outcome {
                ChildOutcome::ErrnoValue(errno) => entry.with_errno(*errno),
                ChildOutcome::Signaled(signal) => entry.with_signal(*signal),
                _ => entry,
            }
        }
        ProbeEvent::WrapperForkRetry { errno } => entry.with_errno(*errno),
        ProbeEvent::WrapperRestarted { restarts, memory } => entry
            .with_outcome(Outcome::OomKilled)
            .with_count(u64::from(*restarts))
            .with_details(serde_json::json!({ "memory": memory_details(*memory) })),
        ProbeEvent::WrapperOomStopped { memory } => entry
            .with_outcome(Outcome::OomStopped)
            .with_details(serde_json::json!({ "memory": memory_details(*memory) })),
        ProbeEvent::TargetPublished { path } => entry.with_path(path),
        ProbeEvent::SlowTarget { path, elapsed } => entry
            .with_path(path)
            .with_latency_ns(u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)),
        ProbeEvent::CursorLockTimeout { thread } => {
            entry.with_details(serde_json::json!({ "thread": thread }))
        }
        ProbeEvent::DrainBurst { bytes } => entry.with_count(*bytes as u64),
        ProbeEvent::WorkersAbandoned { count } => entry.with_count(*count as u64),
        ProbeEvent::TransitionRejected { from, to } => entry.with_details(
            serde_json::json!({ "from": from.name(), "to": to.name() }),
        ),
        ProbeEvent::WalkerAborted {
            last_target,
            fault_addr,
        } => {
            let entry = entry
                .with_outcome(Outcome::Aborted)
                .with_details(serde_json::json!({ "fault_addr": format!("{fault_addr:#x}") }));
            match last_target {
                Some(path) => entry.with_path(path),
                None => entry,
            }
        }
    }
}

/// Heap, observer and clock for one stressor run.
struct Session {
    stressor: Stressor,
    heap: Arc<SharedHeap>,
    observer: Arc<LogObserver>,
    started: Instant,
}

impl Session {
    fn open(
        stressor: Stressor,
        config: &RunConfig,
        emitter: LogEmitter,
    ) -> Result<Self, HarnessError> {
        let heap = Arc::new(SharedHeap::init(&config.heap_config())?);
        let progress = heap.allocate_counter_slot()?;
        let observer = Arc::new(LogObserver::new(
            emitter,
            Arc::clone(&heap),
            progress,
            stressor.component(),
        ));

        let metric = match heap.intern_const_str(stressor.metric_description()) {
            Ok(shared) => shared.as_str().to_owned(),
            Err(err) => {
                observer.log(
                    LogEntry::event(LogLevel::Warn, "metric_not_shared")
                        .with_component(Component::Heap)
                        .with_details(serde_json::json!({ "error": err.to_string() })),
                );
                stressor.metric_description().to_owned()
            }
        };
        observer.log(
            LogEntry::event(LogLevel::Info, "run_start")
                .with_component(Component::Harness)
                .with_details(serde_json::json!({
                    "stressor": stressor.name(),
                    "metric": metric,
                    "heap_capacity": heap.capacity(),
                    "duration_secs": config.duration_secs,
                    "max_ops": config.max_ops,
                })),
        );

        Ok(Self {
            stressor,
            heap,
            observer,
            started: Instant::now(),
        })
    }

    fn budget<'a>(
        &'a self,
        config: &RunConfig,
        running: &'a AtomicBool,
    ) -> Result<RunBudget<'a>, HarnessError> {
        let progress = self
            .heap
            .counter(self.observer.progress)
            .ok_or(HeapError::Released)?;
        let budget = RunBudget::new(progress)
            .with_max_ops(config.max_ops)
            .with_cancel_flag(running);
        Ok(match config.duration() {
            Some(duration) => budget.with_duration(duration),
            None => budget,
        })
    }

    fn finish(self, result: Result<RunStatus, HarnessError>) -> Result<RunSummary, HarnessError> {
        let ops = self.observer.progress();
        let elapsed = self.started.elapsed();
        let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

        let end = match &result {
            Ok(status) => {
                let mut entry = LogEntry::event(LogLevel::Info, "run_end")
                    .with_outcome(status.outcome())
                    .with_exit_code(status.exit_code());
                if let RunStatus::Completed { restarts } | RunStatus::OomStopped { restarts } =
                    status
                {
                    entry = entry.with_details(serde_json::json!({ "restarts": restarts }));
                }
                if let RunStatus::Aborted {
                    last_target: Some(path),
                    ..
                } = status
                {
                    entry = entry.with_path(path);
                }
                entry
            }
            Err(err) => LogEntry::event(LogLevel::Error, "run_failed")
                .with_outcome(Outcome::Failed)
                .with_exit_code(err.exit_code())
                .with_details(serde_json::json!({ "error": err.to_string() })),
        };
        self.observer.log(
            end.with_component(Component::Harness)
                .with_count(ops)
                .with_duration_ms(duration_ms),
        );

        let Self {
            stressor,
            heap,
            observer,
            ..
        } = self;
        let live = heap.usage()?;
        log_heap_usage(&observer, &live);
        observer.flush();
        drop(observer);

        // abandoned walker threads may still hold the observer, and with it the heap
        let usage = match Arc::try_unwrap(heap) {
            Ok(mut heap) => heap.deinit(),
            Err(_) => live,
        };

        let status = result?;
        Ok(RunSummary {
            stressor,
            status,
            ops,
            elapsed,
            heap: usage,
        })
    }
}

fn log_heap_usage(observer: &LogObserver, usage: &HeapUsage) {
    let mut lines = usage.diagnostics().into_iter();
    if let Some(summary) = lines.next() {
        observer.log(
            LogEntry::event(LogLevel::Info, "heap_usage")
                .with_component(Component::Heap)
                .with_details(serde_json::json!({
                    "used": usage.used,
                    "capacity": usage.capacity,
                    "utilization_percent": usage.utilization_percent(),
                    "interned": usage.interned,
                    "message": summary,
                })),
        );
    }
    for line in lines {
        observer.log(
            LogEntry::event(LogLevel::Warn, "heap_out_of_memory")
                .with_component(Component::Heap)
                .with_details(serde_json::json!({ "message": line })),
        );
    }
}

/// Run the bad-address stressor until the budget or `running` says stop.
pub fn run_badaddr(
    config: &RunConfig,
    emitter: LogEmitter,
    running: &AtomicBool,
) -> Result<RunSummary, HarnessError> {
    let operations = config.operations()?;
    let hazards = config.hazards()?;
    let session = Session::open(Stressor::BadAddress, config, emitter)?;
    let result = drive_badaddr(&session, config, operations, hazards, running);
    session.finish(result)
}

fn drive_badaddr(
    session: &Session,
    config: &RunConfig,
    operations: Vec<Operation>,
    hazards: Vec<AddressHazard>,
    running: &AtomicBool,
) -> Result<RunStatus, HarnessError> {
    let observer: Arc<dyn ProbeObserver> = session.observer.clone();
    let mut sandbox = FaultSandbox::new(SandboxContext::current(), operations, hazards, observer)?
        .with_heap_mapping(session.heap.inherited_mapping());
    let budget = session.budget(config, running)?;

    if !config.sandbox.supervised {
        sandbox.run_loop(&budget)?;
        return Ok(RunStatus::Completed { restarts: 0 });
    }
    let adjuster: &dyn OomAdjuster = if config.sandbox.oom_adjust {
        &ProcOomAdjuster
    } else {
        &NoOomAdjust
    };
    Ok(
        match sandbox.run_supervised(config.oom_policy(), &budget, adjuster)? {
            SupervisedOutcome::Completed { restarts } => RunStatus::Completed { restarts },
            SupervisedOutcome::OomStopped { restarts } => RunStatus::OomStopped { restarts },
        },
    )
}

/// Run the concurrent walker until the budget or `running` says stop, or a thread
/// faults.
pub fn run_walk(
    config: &RunConfig,
    emitter: LogEmitter,
    running: &AtomicBool,
) -> Result<RunSummary, HarnessError> {
    let session = Session::open(Stressor::Walk, config, emitter)?;
    let result = drive_walk(&session, config, running);
    session.finish(result)
}

fn drive_walk(
    session: &Session,
    config: &RunConfig,
    running: &AtomicBool,
) -> Result<RunStatus, HarnessError> {
    let observer: Arc<dyn ProbeObserver> = session.observer.clone();
    let mut walker = ConcurrentWalker::new(config.walker_config(), observer);
    if config.walker.oom_adjust {
        walker = walker.with_oom_adjuster(Arc::new(ProcOomAdjuster));
    }
    let mut run = walker.start(&config.walker.root, config.walker.workers)?;
    let budget = session.budget(config, running)?;
    while budget.keep_running() {
        if run.wait_for_abort(WALK_POLL) {
            break;
        }
    }
    Ok(match run.stop() {
        RunOutcome::Success => RunStatus::Completed { restarts: 0 },
        RunOutcome::Aborted {
            last_target,
            fault_addr,
        } => RunStatus::Aborted {
            last_target,
            fault_addr,
        },
    })
}
