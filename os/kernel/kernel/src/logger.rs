//! # Kernel Log Sink
//!
//! A [`log::Log`] writing one line per record, `"[LEVEL] target: message"`,
//! to a byte sink. On bare metal the sink is QEMU's debug console at
//! [`DEBUG_CONSOLE_PORT`]; run QEMU with `-debugcon stdio` (or
//! `-chardev ...,id=dbg -device isa-debugcon,iobase=0x402,chardev=dbg`) to see it.

use core::fmt::{self, Write};
use log::{LevelFilter, Log, Metadata, Record};

/// I/O port of QEMU's debug console.
pub const DEBUG_CONSOLE_PORT: u16 = 0x402;

pub struct PortLogger {
    max_level: LevelFilter,
    sink: fn(u8),
}

impl PortLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter, sink: fn(u8)) -> Self {
        Self { max_level, sink }
    }
}

struct Sink(fn(u8));

impl Write for Sink {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        s.bytes().for_each(self.0);
        Ok(())
    }
}

impl Log for PortLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // Nowhere to report a failed write to.
        let _ = writeln!(
            Sink(self.sink),
            "[{}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Installs the debug-console logger. Later calls change nothing.
#[cfg(target_os = "none")]
pub fn init(max_level: LevelFilter) {
    static LOGGER: PortLogger =
        PortLogger::new(LevelFilter::Trace, crate::arch::ports::debug_console_write);
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(max_level);
    }
}
