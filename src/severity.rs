//! Log severity levels and the built-in stderr sink.
//!
//! Every [`crate::Connection`] and [`crate::Server`] accepts a log callback.
//! When the application doesn't install one, [`logger_default`] is used,
//! writing a single line per call to stderr.

use std::fmt;
use std::io::Write;

/// Severity of a single log line emitted by the library.
///
/// The numeric values match syslog's severity levels, a convention carried
/// over unchanged from the reference implementation this crate's wire
/// behavior is modeled on.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Severity {
    Err = 3,
    Warning = 4,
    Info = 6,
    Debug = 7,
}

impl Severity {
    fn as_str(self) -> &'static str {
        match self {
            Severity::Err => "err",
            Severity::Warning => "warning",
            Severity::Info => "info",
            Severity::Debug => "debug",
        }
    }

    /// Maps to the `log` crate's level, so a host application that already
    /// uses `log` gets these messages routed through its own subscriber
    /// instead of (or in addition to) the raw callback.
    pub fn to_log_level(self) -> log::Level {
        match self {
            Severity::Err => log::Level::Error,
            Severity::Warning => log::Level::Warn,
            Severity::Info => log::Level::Info,
            Severity::Debug => log::Level::Debug,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The library's built-in log sink: a single atomic write to stderr per
/// call, formatted as `cmdserv <severity>: <message>`.
///
/// Writing the whole line in one `write!` call (rather than building it up
/// piecemeal) keeps output from multiple connections logging concurrently
/// from interleaving mid-line.
pub fn logger_default(severity: Severity, message: &str) {
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = writeln!(handle, "cmdserv <{}>: {}", severity, message);
}

/// Routes a severity/message pair through the `log` crate's own
/// machinery instead of writing to stderr directly. Useful as an
/// alternative default for applications that already configure a `log`
/// backend (`env_logger`, `fern`, etc.) and want cmdserv's diagnostics
/// to show up there instead of on a bare stderr line.
pub fn logger_log_crate(severity: Severity, message: &str) {
    log::log!(severity.to_log_level(), "{}", message);
}
