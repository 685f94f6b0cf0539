//! Runtime checking configuration.
//!
//! Read once from the environment on first use:
//! - `CASTGUARD_MODE`: `fatal` (default) reports a rejected cast and exits
//!   with status 255; `report` reports and lets the program continue; `off`
//!   disables checking entirely.
//! - `CASTGUARD_REPORT_MISSING`: `1` reports casts whose source has no
//!   metadata, with exponential backoff.
//! - `CASTGUARD_LOG`: path of the JSONL diagnostic file (default stderr).

use std::path::PathBuf;
use std::sync::OnceLock;

pub const MODE_ENV: &str = "CASTGUARD_MODE";
pub const REPORT_MISSING_ENV: &str = "CASTGUARD_REPORT_MISSING";
pub const LOG_ENV: &str = "CASTGUARD_LOG";

/// What happens when a cast is rejected.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckMode {
    /// Report, then terminate the process without unwinding.
    #[default]
    Fatal,
    /// Report and continue.
    Report,
    /// No checking.
    Off,
}

impl CheckMode {
    /// Parse from string (case-insensitive). Unknown values fall back to
    /// the default.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "fatal" | "abort" | "strict" | "default" => Self::Fatal,
            "report" | "warn" | "log" | "continue" => Self::Report,
            "off" | "none" | "disabled" | "0" => Self::Off,
            _ => Self::Fatal,
        }
    }

    #[must_use]
    pub const fn checking_enabled(self) -> bool {
        !matches!(self, Self::Off)
    }

    #[must_use]
    pub const fn terminates(self) -> bool {
        matches!(self, Self::Fatal)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fatal => "fatal",
            Self::Report => "report",
            Self::Off => "off",
        }
    }
}

fn flag_enabled(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub mode: CheckMode,
    pub report_missing: bool,
    pub log_path: Option<PathBuf>,
}

impl RuntimeConfig {
    /// Build from an arbitrary variable source.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            mode: lookup(MODE_ENV)
                .map(|v| CheckMode::from_str_loose(&v))
                .unwrap_or_default(),
            report_missing: lookup(REPORT_MISSING_ENV).is_some_and(|v| flag_enabled(&v)),
            log_path: lookup(LOG_ENV)
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        }
    }

    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same settings with a different mode.
    #[must_use]
    pub fn with_mode(mut self, mode: CheckMode) -> Self {
        self.mode = mode;
        self
    }
}

static CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// Process configuration (reads the environment on first call).
#[must_use]
pub fn runtime_config() -> &'static RuntimeConfig {
    CONFIG.get_or_init(RuntimeConfig::from_env)
}
