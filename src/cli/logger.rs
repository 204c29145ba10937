//! Minimal stderr backend for the library's `log` records.

use colored::*;
use log::{Level, LevelFilter, Log, Metadata, Record};

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let label = match record.level() {
            Level::Error => "error:".red().bold(),
            Level::Warn => "warning:".yellow().bold(),
            Level::Info => "info:".cyan(),
            Level::Debug | Level::Trace => "debug:".dimmed(),
        };
        eprintln!("{label} {}", record.args());
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

/// Warnings are always shown; `--debug` adds the negotiation trace.
pub fn init(debug: bool) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(if debug { LevelFilter::Debug } else { LevelFilter::Warn });
    }
}
