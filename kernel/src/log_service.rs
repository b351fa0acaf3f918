//! Kernel logging sink.
//!
//! Routes the `log` crate's macros to the architecture console. Installed
//! once at boot; before that (and in the host test harness) log calls are
//! no-ops.

use log::{Level, LevelFilter, Metadata, Record};

struct KernelLog;

impl log::Log for KernelLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            crate::println!("[{:>5}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: KernelLog = KernelLog;

/// Install the kernel logger.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}
