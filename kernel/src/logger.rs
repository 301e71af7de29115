//! Kernel logger
//!
//! Routes `log` records to the serial port (all levels) and mirrors warnings
//! and errors to the VGA console so they are visible without a serial
//! capture. Records print as `[target] message`, matching the init
//! checklist style of the boot path.

use log::{Level, LevelFilter, Metadata, Record};

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        serial_println!(
            "[{:5}] [{}] {}",
            record.level(),
            record.target(),
            record.args()
        );
        if record.level() <= Level::Warn {
            println!("[{}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the logger. Called once, before any subsystem that logs.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}
