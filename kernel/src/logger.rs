//! `log` facade wired to the serial console.

use crate::serial;
use log::{Level, LevelFilter, Log, Metadata, Record};

/// Compile-time threshold from the `log-*` cargo features.
const MAX_LEVEL: LevelFilter = if cfg!(feature = "log-debug") {
    LevelFilter::Debug
} else if cfg!(feature = "log-warn") {
    LevelFilter::Warn
} else if cfg!(feature = "log-err") {
    LevelFilter::Error
} else {
    LevelFilter::Info
};

struct SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= MAX_LEVEL
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => " WARN",
            Level::Info => " INFO",
            Level::Debug | Level::Trace => "DEBUG",
        };
        serial::print(format_args!("[{tag}] {}\n", record.args()));
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

/// Install the serial logger. Call once, right after `serial::init`.
pub fn init() {
    // Failure means a logger is already set, which cannot happen on this
    // boot path; ignore it rather than panic before panics can print.
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(MAX_LEVEL);
}
