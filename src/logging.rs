/// Structured logging for the Hydstra extraction pipeline
///
/// Provides context-rich logging with channel and site identifiers,
/// timestamps, and severity levels. Supports both console output
/// and file-based logging for scheduled export runs.

use chrono::Utc;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Mutex;

use crate::model::HydstraError;

// ---------------------------------------------------------------------------
// Log Levels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

/// Where a log line originates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
    /// Native library session and calls.
    Hydllp,
    /// HTTP web service transport.
    WebService,
    /// Metadata store queries and relational export.
    Sql,
    /// File export.
    Export,
    /// Orchestration across stages.
    Pipeline,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Hydllp => write!(f, "HYDLLP"),
            Channel::WebService => write!(f, "WEBSVC"),
            Channel::Sql => write!(f, "SQL"),
            Channel::Export => write!(f, "EXPORT"),
            Channel::Pipeline => write!(f, "PIPE"),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureType {
    /// Expected failure - e.g. a site with no archive for the variable
    Expected,
    /// Unexpected failure - indicates server, transport or configuration trouble
    Unexpected,
    /// Unknown - cannot determine if this is expected or not
    Unknown,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureType::Expected => write!(f, "EXPECTED"),
            FailureType::Unexpected => write!(f, "UNEXPECTED"),
            FailureType::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

// ---------------------------------------------------------------------------
// Logger Configuration
// ---------------------------------------------------------------------------

/// Global logger instance
static LOGGER: Mutex<Option<Logger>> = Mutex::new(None);

pub struct Logger {
    /// Minimum log level to display
    min_level: LogLevel,
    /// Optional file path for logging
    log_file: Option<String>,
    /// Whether to include timestamps in console output
    console_timestamps: bool,
}

impl Logger {
    /// Initialize the global logger
    pub fn init(min_level: LogLevel, log_file: Option<String>, console_timestamps: bool) {
        let logger = Logger {
            min_level,
            log_file,
            console_timestamps,
        };

        if let Ok(mut guard) = LOGGER.lock() {
            *guard = Some(logger);
        }
    }

    fn log(&self, level: LogLevel, channel: &Channel, site: Option<&str>, message: &str) {
        if level < self.min_level {
            return;
        }

        let log_entry = format_entry(level, channel, site, message);
        let site_part = site.map(|s| format!(" [{}]", s)).unwrap_or_default();

        // Console output
        if self.console_timestamps {
            match level {
                LogLevel::Error => eprintln!("{}", log_entry),
                LogLevel::Warning => eprintln!("   {}", log_entry),
                LogLevel::Info => println!("   {}", message),
                LogLevel::Debug => println!("   [DEBUG] {}", message),
            }
        } else {
            match level {
                LogLevel::Error => eprintln!("   ✗ {}{}: {}", channel, site_part, message),
                LogLevel::Warning => eprintln!("   ⚠ {}{}: {}", channel, site_part, message),
                LogLevel::Info => println!("   {}", message),
                LogLevel::Debug => {} // Skip debug in non-timestamp mode
            }
        }

        // File output
        if let Some(ref path) = self.log_file {
            if let Err(e) = Self::append_to_file(path, &log_entry) {
                eprintln!("Failed to write to log file {}: {}", path, e);
            }
        }
    }

    fn append_to_file(path: &str, entry: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", entry)?;
        Ok(())
    }
}

/// One log line as written to the log file.
fn format_entry(level: LogLevel, channel: &Channel, site: Option<&str>, message: &str) -> String {
    let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
    let site_part = site.map(|s| format!(" [{}]", s)).unwrap_or_default();
    format!("{} {} {}{}: {}", timestamp, level, channel, site_part, message)
}

// ---------------------------------------------------------------------------
// Public Logging Functions
// ---------------------------------------------------------------------------

/// Initialize the global logger
pub fn init_logger(min_level: LogLevel, log_file: Option<&str>, console_timestamps: bool) {
    Logger::init(min_level, log_file.map(String::from), console_timestamps);
}

fn dispatch(level: LogLevel, channel: Channel, site: Option<&str>, message: &str) {
    if let Ok(guard) = LOGGER.lock() {
        if let Some(logger) = guard.as_ref() {
            logger.log(level, &channel, site, message);
        }
    }
}

/// Log a general informational message
pub fn info(channel: Channel, site: Option<&str>, message: &str) {
    dispatch(LogLevel::Info, channel, site, message);
}

/// Log a warning message
pub fn warn(channel: Channel, site: Option<&str>, message: &str) {
    dispatch(LogLevel::Warning, channel, site, message);
}

/// Log an error message
pub fn error(channel: Channel, site: Option<&str>, message: &str) {
    dispatch(LogLevel::Error, channel, site, message);
}

/// Log a debug message
pub fn debug(channel: Channel, site: Option<&str>, message: &str) {
    dispatch(LogLevel::Debug, channel, site, message);
}

// ---------------------------------------------------------------------------
// Failure Classification Helpers
// ---------------------------------------------------------------------------

/// Classify an RPC failure based on the error and its message
pub fn classify_rpc_failure(err: &HydstraError) -> FailureType {
    match err {
        // The server answers "no data" style conditions with a non-zero
        // error_num; the text is the only way to tell them apart.
        HydstraError::Protocol { message, .. } => {
            let lower = message.to_lowercase();
            if lower.contains("no data") || lower.contains("not found") {
                FailureType::Expected
            } else {
                FailureType::Unknown
            }
        }
        HydstraError::Login(_) | HydstraError::Transport(_) => FailureType::Unexpected,
        HydstraError::Decode(_) => FailureType::Unexpected,
        _ => FailureType::Unknown,
    }
}

/// Log an RPC failure with automatic classification
pub fn log_rpc_failure(channel: Channel, site: Option<&str>, operation: &str, err: &HydstraError) {
    let failure_type = classify_rpc_failure(err);
    let message = format!("{} failed [{}]: {}", operation, failure_type, err);

    match failure_type {
        FailureType::Expected => debug(channel, site, &message),
        FailureType::Unexpected => error(channel, site, &message),
        FailureType::Unknown => warn(channel, site, &message),
    }
}

// ---------------------------------------------------------------------------
// Export Summary Logging
// ---------------------------------------------------------------------------

/// Log a summary of an export run
pub fn log_export_summary(channel: Channel, total: usize, written: usize, skipped: usize) {
    let message = format!(
        "Export complete: {}/{} periods written, {} empty",
        written, total, skipped
    );

    if total > 0 && written == 0 && skipped < total {
        error(channel, None, &message);
    } else if written + skipped < total {
        warn(channel, None, &message);
    } else {
        info(channel, None, &message);
    }
}
