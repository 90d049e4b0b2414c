//! Stderr logger with an environment-selected level filter.

use log::{LevelFilter, Log, Metadata, Record};

use crate::config;

struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        eprintln!("[{:<5}] {}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

/// Install the stderr logger. The level comes from `BREWD_LOG` and
/// defaults to `info`. Safe to call more than once; only the first
/// call takes effect.
pub fn init() {
    let level = std::env::var(config::LOG_ENV_VAR)
        .ok()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info);
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
