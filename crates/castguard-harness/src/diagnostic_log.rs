//! Validation of castguard JSONL diagnostic logs.
//!
//! Checks each line against the report schema written by the runtime and
//! summarizes rejected casts by reason.

use std::collections::BTreeMap;
use std::path::Path;

use castguard_membrane::report::{EVENT_BAD_CAST, EVENT_MISSING_METADATA};
use castguard_membrane::{CheckMode, DiagnosticRecord, RejectReason};
use serde::Serialize;

const LEVELS: [&str; 4] = ["info", "warn", "error", "fatal"];

const REASONS: [RejectReason; 4] = [
    RejectReason::NegativeOffset,
    RejectReason::UnknownOffset,
    RejectReason::UnknownHash,
    RejectReason::TypeMismatch,
];

const MODES: [CheckMode; 3] = [CheckMode::Fatal, CheckMode::Report, CheckMode::Off];

/// Validation error for a log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
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

fn error(line_number: usize, field: &str, message: impl Into<String>) -> LogValidationError {
    LogValidationError {
        line_number,
        field: field.to_string(),
        message: message.into(),
    }
}

fn is_hex(value: &str) -> bool {
    value
        .strip_prefix("0x")
        .is_some_and(|digits| !digits.is_empty() && digits.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Validate a single JSONL line against the report schema.
pub fn validate_report_line(
    line: &str,
    line_number: usize,
) -> Result<DiagnosticRecord, Vec<LogValidationError>> {
    let mut errors = Vec::new();

    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return Err(vec![error(line_number, "<json>", format!("invalid JSON: {e}"))]),
    };
    let Some(obj) = value.as_object() else {
        return Err(vec![error(line_number, "<root>", "expected JSON object")]);
    };

    for field in ["timestamp", "level", "event"] {
        if !obj.contains_key(field) {
            errors.push(error(line_number, field, "required field missing"));
        }
    }

    if let Some(level) = obj.get("level").and_then(|v| v.as_str())
        && !LEVELS.contains(&level)
    {
        errors.push(error(line_number, "level", format!("invalid level: '{level}'")));
    }

    if let Some(mode) = obj.get("mode").and_then(|v| v.as_str())
        && !MODES.iter().any(|m| m.as_str() == mode)
    {
        errors.push(error(line_number, "mode", format!("invalid mode: '{mode}'")));
    }

    for field in ["src_addr", "dst_addr", "alloc_base", "resolved_hash", "dst_hash"] {
        if let Some(text) = obj.get(field).and_then(|v| v.as_str())
            && !is_hex(text)
        {
            errors.push(error(line_number, field, format!("expected 0x-prefixed hex, got '{text}'")));
        }
    }

    match obj.get("event").and_then(|v| v.as_str()) {
        Some(EVENT_BAD_CAST) => {
            match obj.get("reason").and_then(|v| v.as_str()) {
                Some(reason) if REASONS.iter().any(|r| r.as_str() == reason) => {}
                Some(reason) => {
                    errors.push(error(line_number, "reason", format!("invalid reason: '{reason}'")));
                }
                None => errors.push(error(line_number, "reason", "bad_cast events must include reason")),
            }
            for field in ["src_addr", "dst_addr", "dst_hash"] {
                if !obj.contains_key(field) {
                    errors.push(error(line_number, field, "bad_cast events must include this field"));
                }
            }
        }
        Some(EVENT_MISSING_METADATA) => {
            if !obj.get("missing_count").is_some_and(serde_json::Value::is_u64) {
                errors.push(error(
                    line_number,
                    "missing_count",
                    "missing_metadata events must include a count",
                ));
            }
        }
        Some(other) => errors.push(error(line_number, "event", format!("unknown event: '{other}'"))),
        None => {}
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    serde_json::from_value::<DiagnosticRecord>(value).map_err(|e| {
        vec![error(
            line_number,
            "<deserialization>",
            format!("failed to deserialize: {e}"),
        )]
    })
}

/// Counts over one log file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogSummary {
    pub lines: usize,
    pub bad_casts: usize,
    pub missing_metadata: usize,
    /// Rejected casts per reason.
    pub reasons: BTreeMap<String, usize>,
    /// Rejected casts per destination type name, when the report carried one.
    pub dst_types: BTreeMap<String, usize>,
    pub errors: Vec<LogValidationError>,
}

impl LogSummary {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn observe(&mut self, record: &DiagnosticRecord) {
        if record.event == EVENT_MISSING_METADATA {
            self.missing_metadata += 1;
            return;
        }
        self.bad_casts += 1;
        if let Some(reason) = &record.reason {
            *self.reasons.entry(reason.clone()).or_default() += 1;
        }
        if let Some(dst) = &record.dst_type {
            *self.dst_types.entry(dst.clone()).or_default() += 1;
        }
    }
}

/// Validate and summarize JSONL text.
#[must_use]
pub fn summarize_log(content: &str) -> LogSummary {
    let mut summary = LogSummary::default();
    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        summary.lines += 1;
        match validate_report_line(line, i + 1) {
            Ok(record) => summary.observe(&record),
            Err(errs) => summary.errors.extend(errs),
        }
    }
    summary
}

/// Validate and summarize an entire JSONL file.
pub fn summarize_log_file(path: &Path) -> Result<LogSummary, std::io::Error> {
    let content = std::fs::read_to_string(path)?;
    Ok(summarize_log(&content))
}
