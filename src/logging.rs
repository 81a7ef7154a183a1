//! Native log forwarding.
//!
//! The engine reports log lines through a C callback. At most one sink is
//! registered per process; the last registration wins. Registering a sink
//! turns the native callback on and clearing it turns it off, so the engine
//! does no formatting work while nobody listens.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::engine::Engine;

/// Severity of a native log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Returns the native integer code.
    pub fn code(&self) -> i32 {
        match self {
            LogLevel::Debug => 0,
            LogLevel::Info => 1,
            LogLevel::Warn => 2,
            LogLevel::Error => 3,
        }
    }

    /// Maps a native code back to a level. Unknown codes are treated as errors.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }

    /// Returns the upper-case label used in formatted lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    /// Parses a level name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One log line received from the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: LogLevel,
    /// Source file as reported by the engine, possibly a full path.
    pub file: String,
    pub line: u32,
    pub message: String,
}

/// Process-wide receiver of native log lines.
pub type LogSink = Arc<dyn Fn(&LogRecord) + Send + Sync>;

static SINK: RwLock<Option<LogSink>> = RwLock::new(None);

/// Renders a record as `[LEVEL] file.cpp:12   - message`.
///
/// Only the file name is kept; the line number is left-aligned in four columns.
pub fn format_log(record: &LogRecord) -> String {
    let file_name = record
        .file
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(&record.file);
    format!(
        "[{}] {}:{:<4} - {}",
        record.level, file_name, record.line, record.message
    )
}

/// Installs or clears the process-wide sink and toggles the native callback.
pub fn set_log_sink(engine: &dyn Engine, sink: Option<LogSink>) {
    let enabled = sink.is_some();
    match SINK.write() {
        Ok(mut slot) => *slot = sink,
        Err(poisoned) => *poisoned.into_inner() = sink,
    }
    engine.set_log_callback(enabled);
}

/// Returns true when a sink is registered.
pub fn has_log_sink() -> bool {
    current_sink().is_some()
}

/// Sets the native verbosity level.
pub fn set_log_level(engine: &dyn Engine, level: LogLevel) {
    tracing::debug!(%level, "setting native log level");
    engine.set_log_level(level);
}

/// A sink forwarding native lines into `tracing` at the matching level.
pub fn tracing_sink() -> LogSink {
    Arc::new(|record: &LogRecord| {
        let line = format_log(record);
        match record.level {
            LogLevel::Debug => tracing::debug!(target: "sd_bridge::native", "{}", line),
            LogLevel::Info => tracing::info!(target: "sd_bridge::native", "{}", line),
            LogLevel::Warn => tracing::warn!(target: "sd_bridge::native", "{}", line),
            LogLevel::Error => tracing::error!(target: "sd_bridge::native", "{}", line),
        }
    })
}

fn current_sink() -> Option<LogSink> {
    match SINK.read() {
        Ok(slot) => slot.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Delivers a record to the registered sink, if any.
///
/// The sink runs outside the registry lock, so it may itself re-register.
pub(crate) fn dispatch(record: &LogRecord) {
    if let Some(sink) = current_sink() {
        sink(record);
    }
}

/// Callback handed to the engine.
///
/// Never unwinds: a panicking sink is reported and the line is dropped.
pub(crate) extern "C" fn forward_native_log(
    level: c_int,
    file: *const c_char,
    line: c_int,
    text: *const c_char,
    _data: *mut c_void,
) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: the engine passes NUL-terminated strings valid for this call.
        let file = unsafe { lossy_string(file) };
        let message = unsafe { lossy_string(text) };
        let record = LogRecord {
            level: LogLevel::from_code(level),
            file,
            line: u32::try_from(line).unwrap_or(0),
            message: message.trim_end_matches(['\r', '\n']).to_string(),
        };
        dispatch(&record);
    }));
    if outcome.is_err() {
        tracing::warn!("native log sink panicked; line dropped");
    }
}

unsafe fn lossy_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}
