//! Structured JSON logger
//!
//! - One log line = one event
//! - `event` first, then `severity`, then fields in alphabetical order
//! - Synchronous, no buffering
//! - Minimum level taken from `SEGREP_LOG` (default `warn`)

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};
use std::sync::OnceLock;

use serde_json::Value;

/// Environment variable holding the minimum severity to emit.
pub const LOG_LEVEL_ENV: &str = "SEGREP_LOG";

/// Log severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Per-request detail
    Trace = 0,
    /// Normal lifecycle operations
    Info = 1,
    /// Recoverable issues (backup failures, retries)
    Warn = 2,
    /// Operation failures
    Error = 3,
    /// Unrecoverable, caller must halt
    Fatal = 4,
}

impl Severity {
    /// Returns the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Trace => "TRACE",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        }
    }

    /// Parse a level name as accepted in `SEGREP_LOG`.
    ///
    /// `off` yields `None` (nothing is logged).
    pub fn parse_level(s: &str) -> Option<Option<Severity>> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Some(Some(Severity::Trace)),
            "info" => Some(Some(Severity::Info)),
            "warn" => Some(Some(Severity::Warn)),
            "error" => Some(Some(Severity::Error)),
            "fatal" => Some(Some(Severity::Fatal)),
            "off" => Some(None),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

static MIN_SEVERITY: OnceLock<Option<Severity>> = OnceLock::new();

#[inline]
fn min_severity() -> Option<Severity> {
    *MIN_SEVERITY.get_or_init(|| {
        std::env::var(LOG_LEVEL_ENV)
            .ok()
            .and_then(|v| Severity::parse_level(&v))
            .unwrap_or(Some(Severity::Warn))
    })
}

/// A structured logger that outputs JSON lines
pub struct Logger;

impl Logger {
    /// Returns true if events of `severity` are currently emitted.
    pub fn enabled(severity: Severity) -> bool {
        min_severity().map(|min| severity >= min).unwrap_or(false)
    }

    /// Log an event with the given severity and fields
    pub fn log(severity: Severity, event: &str, fields: &[(&str, &str)]) {
        if !Self::enabled(severity) {
            return;
        }
        if severity >= Severity::Error {
            Self::log_to_writer(severity, event, fields, &mut io::stderr());
        } else {
            Self::log_to_writer(severity, event, fields, &mut io::stdout());
        }
    }

    /// Render one log line.
    ///
    /// Fields are emitted in alphabetical order; `event` and `severity`
    /// always lead and cannot be overridden by a field of the same name.
    pub fn render(severity: Severity, event: &str, fields: &[(&str, &str)]) -> String {
        let sorted: BTreeMap<&str, &str> = fields
            .iter()
            .filter(|(k, _)| *k != "event" && *k != "severity")
            .copied()
            .collect();

        let mut output = String::with_capacity(128);
        output.push('{');
        output.push_str("\"event\":");
        output.push_str(&Value::from(event).to_string());
        output.push_str(",\"severity\":");
        output.push_str(&Value::from(severity.as_str()).to_string());
        for (key, value) in sorted {
            output.push(',');
            output.push_str(&Value::from(key).to_string());
            output.push(':');
            output.push_str(&Value::from(value).to_string());
        }
        output.push_str("}\n");
        output
    }

    fn log_to_writer<W: Write>(
        severity: Severity,
        event: &str,
        fields: &[(&str, &str)],
        writer: &mut W,
    ) {
        let line = Self::render(severity, event, fields);
        // Logging never fails the caller.
        let _ = writer.write_all(line.as_bytes());
        let _ = writer.flush();
    }

    /// Log at TRACE level
    pub fn trace(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Trace, event, fields);
    }

    /// Log at INFO level
    pub fn info(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Info, event, fields);
    }

    /// Log at WARN level
    pub fn warn(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Warn, event, fields);
    }

    /// Log at ERROR level
    pub fn error(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Error, event, fields);
    }

    /// Log at FATAL level
    pub fn fatal(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Fatal, event, fields);
    }
}
