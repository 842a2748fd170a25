//! Structured logging contract for sysprobe runs.
//!
//! Provides:
//! - [`LogEntry`]: canonical JSONL log record with required + optional fields.
//! - [`LogEmitter`]: writes JSONL lines to a file, stderr, or an in-memory buffer.
//! - [`validate_log_line`]: validates a single JSONL line against the schema.
//! - [`validate_log_file`]: validates an entire JSONL file.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Log entry
// ---------------------------------------------------------------------------

/// Severity level for log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// Parse a lowercase level name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            "fatal" => Some(Self::Fatal),
            _ => None,
        }
    }
}

/// Part of sysprobe that produced the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Harness,
    Sandbox,
    Walker,
    Heap,
}

impl Component {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Harness => "harness",
            Self::Sandbox => "sandbox",
            Self::Walker => "walker",
            Self::Heap => "heap",
        }
    }
}

/// Result of a trial or a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Errno,
    Signaled,
    Timeout,
    OomKilled,
    OomStopped,
    Aborted,
    Failed,
}

const LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "fatal"];
const COMPONENTS: [&str; 4] = ["harness", "sandbox", "walker", "heap"];
const OUTCOMES: [&str; 8] = [
    "success",
    "errno",
    "signaled",
    "timeout",
    "oom_killed",
    "oom_stopped",
    "aborted",
    "failed",
];

/// Canonical structured log entry.
///
/// Required fields: `timestamp`, `trace_id`, `level`, `event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    // Required
    pub timestamp: String,
    pub trace_id: String,
    pub level: LogLevel,
    pub event: String,

    // Optional
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<Component>,
    /// Hazardous operation name for sandbox trials.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// Bad-address class for sandbox trials.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hazard: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    /// Walker target or other filesystem path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ns: Option<u64>,
    /// Wall-clock duration of a whole run (milliseconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    /// Create a new log entry with required fields only.
    #[must_use]
    pub fn new(trace_id: impl Into<String>, level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: now_utc(),
            trace_id: trace_id.into(),
            level,
            event: event.into(),
            component: None,
            operation: None,
            hazard: None,
            outcome: None,
            errno: None,
            signal: None,
            path: None,
            exit_code: None,
            latency_ns: None,
            duration_ms: None,
            count: None,
            details: None,
        }
    }

    /// Entry whose trace id is filled in by the [`LogEmitter`].
    #[must_use]
    pub fn event(level: LogLevel, event: impl Into<String>) -> Self {
        Self::new(String::new(), level, event)
    }

    #[must_use]
    pub fn with_component(mut self, component: Component) -> Self {
        self.component = Some(component);
        self
    }

    /// Set the operation and hazard of a sandbox trial.
    #[must_use]
    pub fn with_trial(mut self, operation: impl Into<String>, hazard: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self.hazard = Some(hazard.into());
        self
    }

    #[must_use]
    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    #[must_use]
    pub fn with_errno(mut self, errno: i32) -> Self {
        self.errno = Some(errno);
        self
    }

    #[must_use]
    pub fn with_signal(mut self, signal: i32) -> Self {
        self.signal = Some(signal);
        self
    }

    #[must_use]
    pub fn with_path(mut self, path: &Path) -> Self {
        self.path = Some(path.display().to_string());
        self
    }

    #[must_use]
    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    #[must_use]
    pub fn with_latency_ns(mut self, ns: u64) -> Self {
        self.latency_ns = Some(ns);
        self
    }

    #[must_use]
    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    /// Set free-form details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Serialize to a single JSONL line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Log emitter
// ---------------------------------------------------------------------------

/// In-memory sink shared between a [`LogEmitter`] and the test reading it.
#[derive(Debug, Clone, Default)]
pub struct LogBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl LogBuffer {
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock()).into_owned()
    }

    /// Parsed entries, skipping lines that fail to parse.
    #[must_use]
    pub fn entries(&self) -> Vec<LogEntry> {
        self.contents()
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.bytes.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Writes structured JSONL log entries.
///
/// Entries below the minimum level are dropped. Trace ids follow
/// `<component>::<run_id>::<seq>`.
pub struct LogEmitter {
    writer: Box<dyn Write + Send>,
    seq: u64,
    component: String,
    run_id: String,
    min_level: LogLevel,
}

impl LogEmitter {
    /// Append to a file, creating it if needed.
    ///
    /// Append mode keeps lines from a forked wrapper and its parent intact.
    pub fn to_file(path: &Path, component: &str, run_id: &str) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::with_writer(
            Box::new(std::io::BufWriter::new(file)),
            component,
            run_id,
        ))
    }

    #[must_use]
    pub fn to_stderr(component: &str, run_id: &str) -> Self {
        Self::with_writer(Box::new(std::io::stderr()), component, run_id)
    }

    /// Create an emitter that writes to memory (for testing).
    #[must_use]
    pub fn to_buffer(component: &str, run_id: &str) -> (Self, LogBuffer) {
        let buffer = LogBuffer::default();
        (
            Self::with_writer(Box::new(buffer.clone()), component, run_id),
            buffer,
        )
    }

    fn with_writer(writer: Box<dyn Write + Send>, component: &str, run_id: &str) -> Self {
        Self {
            writer,
            seq: 0,
            component: component.to_string(),
            run_id: run_id.to_string(),
            min_level: LogLevel::Trace,
        }
    }

    #[must_use]
    pub fn with_min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    #[must_use]
    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }

    /// Generate the next trace ID.
    fn next_trace_id(&mut self) -> String {
        self.seq += 1;
        format!("{}::{}::{:03}", self.component, self.run_id, self.seq)
    }

    /// Emit a log entry with only the required fields.
    pub fn emit(&mut self, level: LogLevel, event: &str) -> std::io::Result<Option<LogEntry>> {
        if !self.enabled(level) {
            return Ok(None);
        }
        let entry = LogEntry::new(self.next_trace_id(), level, event);
        let line = entry.to_jsonl().map_err(std::io::Error::other)?;
        writeln!(self.writer, "{line}")?;
        Ok(Some(entry))
    }

    /// Emit a fully-populated log entry, filling in an empty trace id.
    pub fn emit_entry(&mut self, mut entry: LogEntry) -> std::io::Result<()> {
        if !self.enabled(entry.level) {
            return Ok(());
        }
        if entry.trace_id.is_empty() {
            entry.trace_id = self.next_trace_id();
        }
        let line = entry.to_jsonl().map_err(std::io::Error::other)?;
        writeln!(self.writer, "{line}")
    }

    /// Flush the underlying writer.
    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validation error for a log line.
#[derive(Debug)]
pub struct LogValidationError {
    pub line_number: usize,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for LogValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "line {}: field '{}': {}",
            self.line_number, self.field, self.message
        )
    }
}

fn check_enum(
    obj: &serde_json::Map<String, serde_json::Value>,
    field: &str,
    allowed: &[&str],
    line_number: usize,
    errors: &mut Vec<LogValidationError>,
) {
    if let Some(value) = obj.get(field).and_then(|v| v.as_str())
        && !allowed.contains(&value)
    {
        errors.push(LogValidationError {
            line_number,
            field: field.to_string(),
            message: format!("invalid {field}: '{value}'"),
        });
    }
}

fn is_trace_id(trace_id: &str) -> bool {
    let parts: Vec<&str> = trace_id.split("::").collect();
    parts.len() == 3
        && parts[..2].iter().all(|p| !p.is_empty())
        && !parts[2].is_empty()
        && parts[2].bytes().all(|b| b.is_ascii_digit())
}

/// Validate a single JSONL line against the schema.
pub fn validate_log_line(
    line: &str,
    line_number: usize,
) -> Result<LogEntry, Vec<LogValidationError>> {
    let mut errors = Vec::new();

    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            errors.push(LogValidationError {
                line_number,
                field: "<json>".to_string(),
                message: format!("invalid JSON: {e}"),
            });
            return Err(errors);
        }
    };

    let Some(obj) = value.as_object() else {
        errors.push(LogValidationError {
            line_number,
            field: "<root>".to_string(),
            message: "expected JSON object".to_string(),
        });
        return Err(errors);
    };

    for field in ["timestamp", "trace_id", "level", "event"] {
        if !obj.contains_key(field) {
            errors.push(LogValidationError {
                line_number,
                field: field.to_string(),
                message: "required field missing".to_string(),
            });
        }
    }

    check_enum(obj, "level", &LEVELS, line_number, &mut errors);
    check_enum(obj, "component", &COMPONENTS, line_number, &mut errors);
    check_enum(obj, "outcome", &OUTCOMES, line_number, &mut errors);

    if let Some(trace_id) = obj.get("trace_id").and_then(|v| v.as_str())
        && !is_trace_id(trace_id)
    {
        errors.push(LogValidationError {
            line_number,
            field: "trace_id".to_string(),
            message: format!(
                "trace_id should follow <component>::<run_id>::<seq> format, got: '{trace_id}'"
            ),
        });
    }

    // trials carry both halves of the (operation, hazard) pair
    if obj.contains_key("operation") != obj.contains_key("hazard") {
        errors.push(LogValidationError {
            line_number,
            field: "hazard".to_string(),
            message: "operation and hazard must appear together".to_string(),
        });
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    serde_json::from_value::<LogEntry>(value).map_err(|e| {
        vec![LogValidationError {
            line_number,
            field: "<deserialization>".to_string(),
            message: format!("failed to deserialize: {e}"),
        }]
    })
}

/// Validate an entire JSONL file.
///
/// Returns the non-empty line count and any validation errors found.
pub fn validate_log_file(path: &Path) -> Result<(usize, Vec<LogValidationError>), std::io::Error> {
    let content = std::fs::read_to_string(path)?;
    let mut all_errors = Vec::new();
    let mut line_count = 0;

    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        line_count += 1;
        if let Err(errs) = validate_log_line(line, i + 1) {
            all_errors.extend(errs);
        }
    }

    Ok((line_count, all_errors))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Current time as RFC 3339 UTC with millisecond precision.
#[must_use]
pub fn now_utc() -> String {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format_utc(duration.as_secs(), duration.subsec_millis())
}

/// Civil-from-days conversion (proleptic Gregorian).
fn format_utc(secs: u64, millis: u32) -> String {
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;

    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);

    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{millis:03}Z",
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_entry_serializes_required_fields() {
        let entry = LogEntry::new("sandbox::run-1::001", LogLevel::Info, "run_start");
        let json = entry.to_jsonl().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed["timestamp"].is_string());
        assert_eq!(parsed["trace_id"], "sandbox::run-1::001");
        assert_eq!(parsed["level"], "info");
        assert_eq!(parsed["event"], "run_start");
        assert!(parsed.get("component").is_none());
        assert!(parsed.get("operation").is_none());
        assert!(parsed.get("details").is_none());
    }

    #[test]
    fn log_entry_with_optional_fields() {
        let entry = LogEntry::new("sandbox::run-1::002", LogLevel::Warn, "trial_completed")
            .with_component(Component::Sandbox)
            .with_trial("read", "null")
            .with_outcome(Outcome::Signaled)
            .with_signal(11)
            .with_errno(14)
            .with_path(Path::new("/sys/kernel/notes"))
            .with_exit_code(1)
            .with_latency_ns(150)
            .with_duration_ms(2)
            .with_count(7)
            .with_details(serde_json::json!({"restarts": 1}));

        let parsed: serde_json::Value = serde_json::from_str(&entry.to_jsonl().unwrap()).unwrap();
        assert_eq!(parsed["component"], "sandbox");
        assert_eq!(parsed["operation"], "read");
        assert_eq!(parsed["hazard"], "null");
        assert_eq!(parsed["outcome"], "signaled");
        assert_eq!(parsed["signal"], 11);
        assert_eq!(parsed["errno"], 14);
        assert_eq!(parsed["path"], "/sys/kernel/notes");
        assert_eq!(parsed["exit_code"], 1);
        assert_eq!(parsed["latency_ns"], 150);
        assert_eq!(parsed["duration_ms"], 2);
        assert_eq!(parsed["count"], 7);
        assert!(parsed["details"].is_object());
    }

    #[test]
    fn validate_valid_line() {
        let entry = LogEntry::new("walker::run-1::001", LogLevel::Info, "run_start");
        let result = validate_log_line(&entry.to_jsonl().unwrap(), 1);
        assert!(result.is_ok(), "Valid line should pass: {result:?}");
    }

    #[test]
    fn validate_missing_required_field() {
        let json = r#"{"timestamp":"2026-01-01T00:00:00Z","level":"info","event":"test"}"#;
        let errors = validate_log_line(json, 1).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "trace_id"));
    }

    #[test]
    fn validate_invalid_level_and_outcome() {
        let json = r#"{"timestamp":"2026-01-01T00:00:00Z","trace_id":"a::b::1","level":"critical","event":"test","outcome":"pass"}"#;
        let errors = validate_log_line(json, 1).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "level"));
        assert!(errors.iter().any(|e| e.field == "outcome"));
    }

    #[test]
    fn validate_invalid_json() {
        let errors = validate_log_line("not json at all", 1).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "<json>"));
    }

    #[test]
    fn validate_bad_trace_id_format() {
        for bad in ["no-separator", "a::b", "a::b::c", "::b::1"] {
            let json = format!(
                r#"{{"timestamp":"2026-01-01T00:00:00Z","trace_id":"{bad}","level":"info","event":"test"}}"#
            );
            let errors = validate_log_line(&json, 1).unwrap_err();
            assert!(errors.iter().any(|e| e.field == "trace_id"), "{bad}");
        }
    }

    #[test]
    fn validate_rejects_half_a_trial() {
        let json = r#"{"timestamp":"2026-01-01T00:00:00Z","trace_id":"a::b::1","level":"info","event":"trial_completed","operation":"read"}"#;
        let errors = validate_log_line(json, 3).unwrap_err();
        assert_eq!(errors[0].line_number, 3);
        assert_eq!(errors[0].field, "hazard");
    }

    #[test]
    fn emitter_generates_sequential_trace_ids() {
        let (mut emitter, buffer) = LogEmitter::to_buffer("sandbox", "run-42");
        let e1 = emitter.emit(LogLevel::Info, "start").unwrap().unwrap();
        let e2 = emitter.emit(LogLevel::Info, "end").unwrap().unwrap();
        assert_eq!(e1.trace_id, "sandbox::run-42::001");
        assert_eq!(e2.trace_id, "sandbox::run-42::002");
        assert_eq!(buffer.entries().len(), 2);
    }

    #[test]
    fn emitter_drops_entries_below_min_level() {
        let (emitter, buffer) = LogEmitter::to_buffer("walker", "run-1");
        let mut emitter = emitter.with_min_level(LogLevel::Info);
        assert!(emitter.emit(LogLevel::Debug, "noise").unwrap().is_none());
        emitter
            .emit_entry(LogEntry::event(LogLevel::Warn, "slow_target"))
            .unwrap();
        let entries = buffer.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].trace_id, "walker::run-1::001");
    }

    #[test]
    fn level_names_parse() {
        assert_eq!(LogLevel::from_name("WARN"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_name(" debug "), Some(LogLevel::Debug));
        assert_eq!(LogLevel::from_name("loud"), None);
        assert!(LogLevel::Error > LogLevel::Info);
    }

    #[test]
    fn utc_formatting_is_exact() {
        assert_eq!(format_utc(0, 0), "1970-01-01T00:00:00.000Z");
        assert_eq!(format_utc(951_782_400, 5), "2000-02-29T00:00:00.005Z");
        assert_eq!(format_utc(1_767_225_599, 999), "2025-12-31T23:59:59.999Z");
    }
}
