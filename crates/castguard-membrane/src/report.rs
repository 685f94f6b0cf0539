//! JSONL diagnostic reports.
//!
//! One line per event. Rejected casts carry the addresses, offset, both
//! hashes and, when the registry knows them, the type names. Sinks are
//! pluggable so tests and embedders can capture records in memory.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::CheckMode;
use crate::verify::CastViolation;

/// Frames kept from a captured backtrace.
pub const MAX_BACKTRACE_LINES: usize = 32;

/// Event name for a rejected cast.
pub const EVENT_BAD_CAST: &str = "bad_cast";
/// Event name for a cast whose source has no metadata.
pub const EVENT_MISSING_METADATA: &str = "missing_metadata";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Fatal,
}

/// One diagnostic line.
///
/// Required fields: `timestamp`, `level`, `event`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    pub timestamp: String,
    pub level: LogLevel,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alloc_base: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Running count of missing-metadata casts at the time of the report.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<Vec<String>>,
}

fn hex(value: usize) -> String {
    format!("{value:#x}")
}

impl DiagnosticRecord {
    #[must_use]
    pub fn new(level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: now_utc(),
            level,
            event: event.into(),
            reason: None,
            src_addr: None,
            dst_addr: None,
            alloc_base: None,
            offset: None,
            resolved_hash: None,
            dst_hash: None,
            resolved_type: None,
            dst_type: None,
            mode: None,
            missing_count: None,
            backtrace: None,
        }
    }

    /// Record for a refused cast.
    #[must_use]
    pub fn bad_cast(violation: &CastViolation, mode: CheckMode) -> Self {
        let level = if mode.terminates() {
            LogLevel::Fatal
        } else {
            LogLevel::Error
        };
        let mut record = Self::new(level, EVENT_BAD_CAST).with_mode(mode);
        record.reason = Some(violation.reason.as_str().to_string());
        record.src_addr = Some(hex(violation.src));
        record.dst_addr = Some(hex(violation.dst));
        record.alloc_base = Some(hex(violation.alloc_base));
        record.offset = Some(violation.offset);
        record.resolved_hash = violation.resolved.map(|h| h.to_string());
        record.dst_hash = Some(violation.dst_hash.to_string());
        record
    }

    /// Record for a cast from an address without metadata.
    #[must_use]
    pub fn missing_metadata(src: usize, dst: usize, count: u64) -> Self {
        let mut record = Self::new(LogLevel::Warn, EVENT_MISSING_METADATA);
        record.src_addr = Some(hex(src));
        record.dst_addr = Some(hex(dst));
        record.missing_count = Some(count);
        record
    }

    #[must_use]
    pub fn with_mode(mut self, mode: CheckMode) -> Self {
        self.mode = Some(mode.as_str().to_string());
        self
    }

    #[must_use]
    pub fn with_type_names(mut self, resolved: Option<String>, dst: Option<String>) -> Self {
        self.resolved_type = resolved;
        self.dst_type = dst;
        self
    }

    #[must_use]
    pub fn with_backtrace(mut self, frames: Vec<String>) -> Self {
        if !frames.is_empty() {
            self.backtrace = Some(frames);
        }
        self
    }

    /// Serialize to a single JSON line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Destination for diagnostic records.
pub trait ReportSink: Send + Sync {
    fn emit(&self, record: &DiagnosticRecord) -> io::Result<()>;
}

impl<S: ReportSink + ?Sized> ReportSink for Arc<S> {
    fn emit(&self, record: &DiagnosticRecord) -> io::Result<()> {
        (**self).emit(record)
    }
}

/// Writes one JSON object per line to a file or stderr.
pub struct JsonlSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl JsonlSink {
    /// Append to `path`, creating it if needed.
    pub fn to_file(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(Box::new(file)),
        })
    }

    #[must_use]
    pub fn stderr() -> Self {
        Self {
            writer: Mutex::new(Box::new(io::stderr())),
        }
    }

    /// File sink when `path` is given and can be opened, stderr otherwise.
    #[must_use]
    pub fn from_path(path: Option<&Path>) -> Self {
        path.and_then(|p| Self::to_file(p).ok())
            .unwrap_or_else(Self::stderr)
    }
}

impl ReportSink for JsonlSink {
    fn emit(&self, record: &DiagnosticRecord) -> io::Result<()> {
        let line = record.to_jsonl().map_err(io::Error::other)?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{line}")?;
        writer.flush()
    }
}

/// Keeps records in memory.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<DiagnosticRecord>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn records(&self) -> Vec<DiagnosticRecord> {
        self.records.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl ReportSink for MemorySink {
    fn emit(&self, record: &DiagnosticRecord) -> io::Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

/// Exponential backoff for missing-metadata reports: the 1st, 2nd, 4th,
/// 8th, ... occurrence is reported.
#[derive(Debug, Default)]
pub struct MissingReportThrottle {
    seen: AtomicU64,
}

impl MissingReportThrottle {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            seen: AtomicU64::new(0),
        }
    }

    /// Count one occurrence; returns the running count when it should be
    /// reported.
    pub fn hit(&self) -> Option<u64> {
        let count = self.seen.fetch_add(1, Ordering::Relaxed) + 1;
        count.is_power_of_two().then_some(count)
    }

    #[must_use]
    pub fn seen(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }
}

/// Capture the current stack as text lines, capped at
/// [`MAX_BACKTRACE_LINES`].
#[must_use]
pub fn capture_backtrace() -> Vec<String> {
    let trace = std::backtrace::Backtrace::force_capture();
    trace
        .to_string()
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .take(MAX_BACKTRACE_LINES)
        .map(str::to_string)
        .collect()
}

/// RFC 3339 UTC timestamp with millisecond precision.
#[must_use]
pub fn now_utc() -> String {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format_utc(duration.as_secs(), duration.subsec_millis())
}

fn format_utc(secs: u64, millis: u32) -> String {
    let days = (secs / 86_400) as i64;
    let (year, month, day) = civil_from_days(days);
    let rem = secs % 86_400;
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{millis:03}Z",
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60,
    )
}

/// Gregorian date of a day count since 1970-01-01.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::RejectReason;
    use castguard_core::TypeHash;

    fn violation() -> CastViolation {
        CastViolation {
            reason: RejectReason::TypeMismatch,
            src: 0x1000,
            dst: 0x1008,
            alloc_base: 0x1000,
            offset: 8,
            resolved: Some(TypeHash(0x2)),
            dst_hash: TypeHash(0x3),
        }
    }

    #[test]
    fn bad_cast_serializes_addresses_and_hashes() {
        let record = DiagnosticRecord::bad_cast(&violation(), CheckMode::Report);
        let json = record.to_jsonl().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["level"], "error");
        assert_eq!(parsed["event"], "bad_cast");
        assert_eq!(parsed["reason"], "type_mismatch");
        assert_eq!(parsed["src_addr"], "0x1000");
        assert_eq!(parsed["offset"], 8);
        assert_eq!(parsed["resolved_hash"], "0x0000000000000002");
        assert_eq!(parsed["mode"], "report");
        assert!(parsed.get("backtrace").is_none());
        assert!(parsed.get("missing_count").is_none());
    }

    #[test]
    fn fatal_mode_raises_level() {
        let record = DiagnosticRecord::bad_cast(&violation(), CheckMode::Fatal);
        assert_eq!(record.level, LogLevel::Fatal);
    }

    #[test]
    fn records_round_trip() {
        let record = DiagnosticRecord::missing_metadata(0x10, 0x18, 4)
            .with_type_names(Some("class.A".into()), None)
            .with_backtrace(vec!["frame".into()]);
        let back: DiagnosticRecord = serde_json::from_str(&record.to_jsonl().unwrap()).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn memory_sink_collects() {
        let sink = MemorySink::new();
        assert!(sink.is_empty());
        sink.emit(&DiagnosticRecord::new(LogLevel::Info, "x")).unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.records()[0].event, "x");
    }

    #[test]
    fn file_sink_appends_lines() {
        let path = std::env::temp_dir().join(format!("castguard-report-{}.jsonl", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let sink = JsonlSink::to_file(&path).unwrap();
        sink.emit(&DiagnosticRecord::new(LogLevel::Warn, "a")).unwrap();
        sink.emit(&DiagnosticRecord::new(LogLevel::Warn, "b")).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn throttle_reports_powers_of_two() {
        let throttle = MissingReportThrottle::new();
        let reported: Vec<u64> = (0..20).filter_map(|_| throttle.hit()).collect();
        assert_eq!(reported, vec![1, 2, 4, 8, 16]);
        assert_eq!(throttle.seen(), 20);
    }

    #[test]
    fn timestamps_use_the_civil_calendar() {
        assert_eq!(format_utc(0, 0), "1970-01-01T00:00:00.000Z");
        assert_eq!(format_utc(951_782_400, 5), "2000-02-29T00:00:00.005Z");
        assert_eq!(format_utc(1_700_000_000, 123), "2023-11-14T22:13:20.123Z");
    }

    #[test]
    fn backtrace_is_capped() {
        assert!(capture_backtrace().len() <= MAX_BACKTRACE_LINES);
    }
}
