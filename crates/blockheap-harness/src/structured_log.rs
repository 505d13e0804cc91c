//! Structured JSONL logging for harness runs.
//!
//! Provides:
//! - [`LogEntry`]: one JSONL record, either harness-level or converted from
//!   an [`AllocatorLogRecord`].
//! - [`LogEmitter`]: writes JSONL lines to a file or an in-memory buffer.
//! - [`validate_log_line`]: checks one line against the required fields.

use std::io::Write;
use std::path::Path;

use blockheap_core::malloc::{AllocatorLogLevel, AllocatorLogRecord};
use serde::{Deserialize, Serialize};

/// Severity level for log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<AllocatorLogLevel> for LogLevel {
    fn from(level: AllocatorLogLevel) -> Self {
        match level {
            AllocatorLogLevel::Trace => Self::Trace,
            AllocatorLogLevel::Debug => Self::Debug,
            AllocatorLogLevel::Info => Self::Info,
            AllocatorLogLevel::Warn => Self::Warn,
            AllocatorLogLevel::Error => Self::Error,
        }
    }
}

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
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ptr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    /// Size-class bin; one past the last class means a big allocation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bin: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_allocated: Option<usize>,
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
            symbol: None,
            decision_id: None,
            ptr: None,
            size: None,
            bin: None,
            outcome: None,
            active_count: None,
            total_allocated: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    #[must_use]
    pub fn with_outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
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

impl From<&AllocatorLogRecord> for LogEntry {
    fn from(record: &AllocatorLogRecord) -> Self {
        let mut entry = Self::new(record.trace_id.clone(), record.level.into(), record.event);
        entry.symbol = Some(record.symbol.to_string());
        entry.decision_id = Some(record.decision_id);
        entry.ptr = record.ptr.map(|ptr| format!("{ptr:#x}"));
        entry.size = record.size;
        entry.bin = record.bin;
        entry.outcome = Some(record.outcome.to_string());
        entry.active_count = Some(record.active_count);
        entry.total_allocated = Some(record.total_allocated);
        if !record.details.is_empty() {
            entry.details = Some(serde_json::Value::String(record.details.clone()));
        }
        entry
    }
}

/// Writes structured JSONL log entries to a file or buffer.
pub struct LogEmitter {
    writer: Box<dyn Write>,
    lines: u64,
}

impl LogEmitter {
    /// Create an emitter that writes to a file.
    pub fn to_file(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self {
            writer: Box::new(std::io::BufWriter::new(file)),
            lines: 0,
        })
    }

    /// Create an emitter over any writer (tests pass a `Vec<u8>`).
    #[must_use]
    pub fn to_writer(writer: impl Write + 'static) -> Self {
        Self {
            writer: Box::new(writer),
            lines: 0,
        }
    }

    pub fn emit(&mut self, entry: &LogEntry) -> Result<(), crate::HarnessError> {
        let line = entry.to_jsonl()?;
        writeln!(self.writer, "{line}")?;
        self.lines += 1;
        Ok(())
    }

    /// Emits every record, oldest first.
    pub fn emit_records<'a>(
        &mut self,
        records: impl IntoIterator<Item = &'a AllocatorLogRecord>,
    ) -> Result<(), crate::HarnessError> {
        for record in records {
            self.emit(&LogEntry::from(record))?;
        }
        Ok(())
    }

    /// Lines written so far.
    #[must_use]
    pub fn lines(&self) -> u64 {
        self.lines
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// Validates one JSONL line: it must parse and carry the required fields.
pub fn validate_log_line(line: &str) -> Result<LogEntry, String> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|err| format!("invalid json: {err}"))?;
    for field in ["timestamp", "trace_id", "level", "event"] {
        if value.get(field).is_none() {
            return Err(format!("missing required field `{field}`"));
        }
    }
    serde_json::from_value(value).map_err(|err| format!("schema mismatch: {err}"))
}

fn now_utc() -> String {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = duration.as_secs();
    // Approximate calendar fields; only ordering matters to consumers.
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
        1970 + secs / 31_557_600,
        (secs % 31_557_600) / 2_629_800 + 1,
        (secs % 2_629_800) / 86400 + 1,
        (secs % 86400) / 3600,
        (secs % 3600) / 60,
        secs % 60,
        duration.subsec_millis(),
    )
}
