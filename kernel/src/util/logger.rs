// =============================================================================
// MinimalOS NextGen — Kernel Logger
// =============================================================================
//
// A `log::Log` implementation backed by the COM1 serial port. We keep the
// `log` crate's standard macros (`log::info!`, `log::warn!`, ...) rather
// than a bespoke `kprintln!` family, since `log = "0.4"` is already a
// declared kernel dependency.
//
// This works before the heap is initialized: `log::Record` formatting goes
// straight to `core::fmt::Write` on the serial port, no allocation required.
// =============================================================================

use core::fmt::Write;

use log::{LevelFilter, Metadata, Record};

use crate::arch::serial::SERIAL;

struct SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let color = match record.level() {
            log::Level::Trace => "\x1b[90m",
            log::Level::Debug => "\x1b[36m",
            log::Level::Info => "\x1b[32m",
            log::Level::Warn => "\x1b[33m",
            log::Level::Error => "\x1b[31m",
        };
        let mut serial = SERIAL.lock();
        let _ = write!(serial, "{color}[{:>5}]\x1b[0m ", record.level());
        let _ = serial.write_fmt(*record.args());
        let _ = serial.write_str("\n");
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

/// Installs the kernel logger. Must run before any other module logs.
///
/// # Panics
/// If called more than once (`log::set_logger` only succeeds the first time).
pub fn init() {
    SERIAL.lock().init();
    log::set_logger(&LOGGER).expect("logger: init() called more than once");
    log::set_max_level(if cfg!(debug_assertions) {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    });
}
