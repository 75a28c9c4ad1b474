//! Diagnostic output on stderr.
//!
//! Backend for the `log` facade. Every line carries a fixed-width level tag
//! so fault traces line up:
//!
//! ```text
//! [INFO ] segment 1 page 0x804a000 offset 4096 bytes 300 | faults 2 ...
//! ```

use std::io::{self, Write};

use log::{Level, LevelFilter, Log, Metadata, Record};

/// Writes log records to stderr.
#[derive(Debug)]
pub struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

/// Fixed-width tag for `level`.
pub fn prefix(level: Level) -> &'static str {
    match level {
        Level::Trace => "[TRACE]",
        Level::Debug => "[DEBUG]",
        Level::Info => "[INFO ]",
        Level::Warn => "[WARN ]",
        Level::Error => "[ERROR]",
    }
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // Unbuffered, and nothing to do if stderr is gone.
        let _ = writeln!(io::stderr().lock(), "{} {}", prefix(record.level()), record.args());
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
    }
}

/// Install [`StderrLogger`] as the global logger with `level` as the
/// threshold.
///
/// Calling it again only changes the threshold.
pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_err() {
        log::debug!("logger already installed");
    }
    log::set_max_level(level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_are_fixed_width() {
        for level in [
            Level::Trace,
            Level::Debug,
            Level::Info,
            Level::Warn,
            Level::Error,
        ] {
            assert_eq!(prefix(level).len(), 7);
        }
        assert_eq!(prefix(Level::Info), "[INFO ]");
    }

    #[test]
    fn threshold_follows_max_level() {
        init(LevelFilter::Warn);
        let info = Metadata::builder().level(Level::Info).build();
        let error = Metadata::builder().level(Level::Error).build();
        assert!(!LOGGER.enabled(&info));
        assert!(LOGGER.enabled(&error));
    }
}
