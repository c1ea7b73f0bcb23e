use crate::qemu_fmt::QemuSink;
use core::fmt::{self, Write};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// `log` backend writing to the QEMU debug console.
pub struct QemuLogger {
    max_level: LevelFilter,
}

impl QemuLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self { max_level }
    }

    /// Register this logger with the `log` facade. Call once during early boot.
    ///
    /// # Errors
    /// Fails if a logger was already installed.
    pub fn install(&'static self) -> Result<(), SetLoggerError> {
        log::set_logger(self)?;
        log::set_max_level(self.max_level);
        Ok(())
    }
}

/// Render a record as `[LEVEL] target: message\n`.
///
/// # Errors
/// Propagates errors from `out`.
pub fn write_record(out: &mut impl Write, record: &Record) -> fmt::Result {
    writeln!(out, "[{}] {}: {}", record.level(), record.target(), record.args())
}

impl Log for QemuLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let _ = write_record(&mut QemuSink, record);
    }

    fn flush(&self) {}
}
