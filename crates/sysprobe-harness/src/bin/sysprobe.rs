//! CLI entrypoint for the sysprobe stress harness.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Args, Parser, Subcommand};
use sysprobe_core::sandbox::OPERATIONS;
use sysprobe_core::{AddressHazard, install_interrupt_handler, running_flag};
use sysprobe_harness::structured_log::validate_log_file;
use sysprobe_harness::{
    EXIT_OK, HarnessError, LogEmitter, Overrides, RunConfig, Stressor, run_badaddr, run_walk,
};

/// Fault-injection stress harness.
#[derive(Debug, Parser)]
#[command(name = "sysprobe")]
#[command(about = "Drive the kernel with hazardous calls and concurrent probing")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct CommonArgs {
    /// JSON run configuration; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Run time limit in seconds (0 runs until interrupted).
    #[arg(long)]
    duration: Option<u64>,
    /// Stop after this many operations (0 is unlimited).
    #[arg(long)]
    max_ops: Option<u64>,
    /// JSONL log file (appended); stderr when omitted.
    #[arg(long)]
    log: Option<PathBuf>,
    /// Minimum log level: trace, debug, info, warn, error.
    #[arg(long)]
    log_level: Option<String>,
    /// Run identifier used in trace ids.
    #[arg(long)]
    run_id: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Call hazardous operations with bad addresses, one sandboxed child per trial.
    Badaddr {
        #[command(flatten)]
        common: CommonArgs,
        /// Operation to run (repeatable); all when omitted.
        #[arg(long = "op")]
        operations: Vec<String>,
        /// Bad-address class to use (repeatable); all when omitted.
        #[arg(long = "hazard")]
        hazards: Vec<String>,
        /// Run trials directly instead of inside an OOM-preferred wrapper.
        #[arg(long)]
        unsupervised: bool,
        /// `stop` or `restart` after the wrapper is OOM-killed.
        #[arg(long)]
        oom_policy: Option<String>,
        /// Print operation and hazard names and exit.
        #[arg(long)]
        list: bool,
    },
    /// Walk a resource tree while workers probe the current target.
    Walk {
        #[command(flatten)]
        common: CommonArgs,
        /// Tree to walk.
        #[arg(long)]
        root: Option<PathBuf>,
        /// Number of probing workers.
        #[arg(long)]
        workers: Option<usize>,
        /// Maximum directory depth.
        #[arg(long)]
        max_depth: Option<usize>,
        /// Do not drain the kernel log between targets.
        #[arg(long)]
        no_drain: bool,
    },
    /// Validate a structured JSONL log against the schema.
    ValidateLog {
        /// Log file to check.
        #[arg(long)]
        log: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli.command) {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            eprintln!("sysprobe: {err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

fn run(command: Command) -> Result<i32, HarnessError> {
    match command {
        Command::Badaddr {
            common,
            operations,
            hazards,
            unsupervised,
            oom_policy,
            list,
        } => {
            if list {
                for op in OPERATIONS.iter() {
                    println!("op {}", op.name);
                }
                for hazard in AddressHazard::ALL {
                    println!("hazard {hazard}");
                }
                return Ok(EXIT_OK);
            }
            let overrides = Overrides {
                operations,
                hazards,
                unsupervised,
                oom_policy,
                ..common_overrides(&common)
            };
            stress(Stressor::BadAddress, common.config, overrides)
        }
        Command::Walk {
            common,
            root,
            workers,
            max_depth,
            no_drain,
        } => {
            let overrides = Overrides {
                root,
                workers,
                max_depth,
                no_drain,
                ..common_overrides(&common)
            };
            stress(Stressor::Walk, common.config, overrides)
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = validate_log_file(&log)?;
            for error in &errors {
                eprintln!("{error}");
            }
            if !errors.is_empty() {
                return Err(HarnessError::InvalidLog(errors.len()));
            }
            eprintln!("{}: {lines} valid entries", log.display());
            Ok(EXIT_OK)
        }
    }
}

fn common_overrides(common: &CommonArgs) -> Overrides {
    Overrides {
        duration_secs: common.duration,
        max_ops: common.max_ops,
        log_path: common.log.clone(),
        log_level: common.log_level.clone(),
        run_id: common.run_id.clone(),
        ..Overrides::default()
    }
}

fn stress(
    stressor: Stressor,
    config_path: Option<PathBuf>,
    overrides: Overrides,
) -> Result<i32, HarnessError> {
    let mut config = match &config_path {
        Some(path) => RunConfig::from_file(path)?,
        None => RunConfig::default(),
    };
    config.apply(overrides);

    let run_id = config.run_id.clone().unwrap_or_else(default_run_id);
    let component = stressor.component().as_str();
    let emitter = match &config.log_path {
        Some(path) => LogEmitter::to_file(path, component, &run_id)?,
        None => LogEmitter::to_stderr(component, &run_id),
    }
    .with_min_level(config.log_level()?);

    install_interrupt_handler().map_err(HarnessError::Interrupt)?;
    let running = running_flag();
    let summary = match stressor {
        Stressor::BadAddress => run_badaddr(&config, emitter, running)?,
        Stressor::Walk => run_walk(&config, emitter, running)?,
    };

    eprintln!(
        "{}: {:?}, {} ops in {:.1}s",
        stressor.name(),
        summary.status,
        summary.ops,
        summary.elapsed.as_secs_f64()
    );
    for line in summary.heap.diagnostics() {
        eprintln!("{line}");
    }
    Ok(summary.status.exit_code())
}

fn default_run_id() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    format!("{}-{secs}", std::process::id())
}
