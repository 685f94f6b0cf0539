//! Tooling around the castguard checker.
//!
//! This crate provides:
//! - Name hashing: canonical names and type hashes as the instrumentation sees them
//! - Layout reports: descriptors and registration tables for a layout manifest
//! - Diagnostic log validation: schema checks and reject summaries for JSONL reports

#![forbid(unsafe_code)]

pub mod diagnostic_log;
pub mod layout_report;

pub use diagnostic_log::{LogSummary, LogValidationError, summarize_log_file, validate_report_line};
pub use layout_report::{HarnessError, HashReport, LayoutReport, hash_names, load_manifest_file};
