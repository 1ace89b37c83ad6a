//! `log` backend writing to standard error.

use log::{LevelFilter, Log, Metadata, Record};

struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            crate::printerrln!("preloader: {}: {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the stderr logger. Called once from the start routine, before
/// anything can emit a diagnostic.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}
