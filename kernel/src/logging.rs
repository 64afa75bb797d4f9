//! Kernel logging facility
//!
//! Implements the `log` facade without allocating: each record is formatted
//! into a fixed buffer and handed to a sink (the serial port on hardware, a
//! capture buffer in tests). Log levels follow the build configuration.

use core::fmt::{self, Write};

use arrayvec::ArrayString;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Mutex;

/// Longest line a record is formatted to; the rest is cut off.
pub const LOG_LINE_MAX: usize = 256;

/// Receives one formatted line, without a trailing newline.
pub type LogSink = fn(&str);

/// Global logger instance available throughout the kernel
pub static LOGGER: Logger = Logger::new();

pub struct Logger {
    sink: Mutex<Option<LogSink>>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    pub const fn new() -> Logger {
        Logger {
            sink: Mutex::new(None),
        }
    }

    pub fn set_sink(&self, sink: LogSink) {
        *self.sink.lock() = Some(sink);
    }
}

/// Writer that silently drops whatever does not fit.
struct Truncating<'a>(&'a mut ArrayString<LOG_LINE_MAX>);

impl Write for Truncating<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.0.remaining_capacity();
        let mut end = s.len().min(room);
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        self.0.push_str(&s[..end]);
        Ok(())
    }
}

/// Formats a record as "[LEVEL] message".
pub fn format_record(record: &Record) -> ArrayString<LOG_LINE_MAX> {
    let mut line = ArrayString::new();
    let _ = write!(Truncating(&mut line), "[{}] {}", record.level(), record.args());
    line
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            // holding the lock while writing keeps lines from interleaving
            let sink = self.sink.lock();
            if let Some(sink) = *sink {
                sink(&format_record(record));
            }
        }
    }

    fn flush(&self) {}
}

/// Initializes the logging system
///
/// Only core 0 installs the logger; other cores return immediately.
/// Debug builds log at `Debug`, release builds at `Info`.
pub fn init(cpu_id: u32, sink: LogSink) -> Result<(), SetLoggerError> {
    if cpu_id != 0 {
        return Ok(());
    }
    LOGGER.set_sink(sink);
    log::set_logger(&LOGGER).map(|()| {
        log::set_max_level(
            #[cfg(debug_assertions)]
            LevelFilter::Debug,
            #[cfg(not(debug_assertions))]
            LevelFilter::Info,
        )
    })
}
