//! Re-emit the engine's glog-formatted output through `tracing`.
//!
//! Lines look like `I0317 10:21:05.123456 42 deployer.cc:88] message`; the
//! leading letter selects the level. Anything else is logged at info for
//! stdout and error for stderr.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{error, info, warn};

static GLOG_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([IWEF])\d+ \S+ \d+ (?:[^\]]*\] )?(.*)$").expect("valid glog regex")
});

/// Severity parsed from a glog prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Split a glog line into severity and message body.
pub fn parse(line: &str) -> Option<(Severity, &str)> {
    let caps = GLOG_LINE.captures(line)?;
    let severity = match caps.get(1)?.as_str() {
        "I" => Severity::Info,
        "W" => Severity::Warning,
        _ => Severity::Error,
    };
    Some((severity, caps.get(2)?.as_str()))
}

/// Log one line of engine output.
pub fn forward(line: &str, is_stderr: bool) {
    match parse(line) {
        Some((Severity::Info, msg)) => info!(target: "rimehost::engine", "{}", msg),
        Some((Severity::Warning, msg)) => warn!(target: "rimehost::engine", "{}", msg),
        Some((Severity::Error, msg)) => error!(target: "rimehost::engine", "{}", msg),
        None if is_stderr => error!(target: "rimehost::engine", "{}", line),
        None => info!(target: "rimehost::engine", "{}", line),
    }
}
