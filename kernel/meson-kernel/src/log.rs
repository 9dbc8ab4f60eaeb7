//! Kernel logging backends.
//!
//! Two phases. Before the heap exists, lightweight functions write straight
//! to COM1 with no locks or allocation; `init_early_serial` registers them
//! with the macro layer. Once the heap is up, `init_logger` swaps in a
//! [`Logger`] that fans output out to a `Vec<Box<dyn LogSink>>` behind a
//! spinlock (the serial sink is the only one in-tree; the display console
//! is an external collaborator).

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt::{self, Write as _};

use meson_core::log::LogLevel;
use meson_core::sync::SpinLock;

use crate::drivers::uart16550::{COM1, Uart16550};

/// An output sink for the kernel logger.
pub trait LogSink: Send + Sync {
    /// Writes a string fragment.
    fn write_str(&self, s: &str);
    /// Most verbose level this sink accepts.
    fn max_level(&self) -> LogLevel;
    /// Name for diagnostics.
    fn name(&self) -> &str;
}

/// A [`LogSink`] writing to a 16550 UART.
pub struct SerialSink {
    uart: Uart16550,
    max_level: LogLevel,
}

impl SerialSink {
    /// Creates a serial sink.
    pub fn new(uart: Uart16550, max_level: LogLevel) -> Self {
        Self { uart, max_level }
    }
}

impl LogSink for SerialSink {
    fn write_str(&self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.uart.write_byte(b'\r');
            }
            self.uart.write_byte(byte);
        }
    }

    fn max_level(&self) -> LogLevel {
        self.max_level
    }

    fn name(&self) -> &str {
        "serial"
    }
}

// ---------------------------------------------------------------------------
// Early serial (pre-heap)
// ---------------------------------------------------------------------------

/// Stack-constructed writer around the UART (a `u16`, nothing more).
struct SerialWriter(Uart16550);

impl fmt::Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.0.write_byte(b'\r');
            }
            self.0.write_byte(byte);
        }
        Ok(())
    }
}

fn early_serial_print(args: fmt::Arguments<'_>) {
    let mut w = SerialWriter(Uart16550::new(COM1));
    let _ = w.write_fmt(args);
}

fn early_serial_log(level: LogLevel, args: fmt::Arguments<'_>) {
    let nanos = crate::time::monotonic_ns();
    let micros = nanos / 1_000;
    let mut w = SerialWriter(Uart16550::new(COM1));
    let _ = write!(
        w,
        "[{:>5}.{:06}] {} {}\n",
        micros / 1_000_000,
        micros % 1_000_000,
        level.name(),
        args
    );
}

/// Initializes COM1 and registers the lock-free early logging path.
pub fn init_early_serial() {
    Uart16550::new(COM1).init();
    // SAFETY: Both functions only construct a stack UART handle and poll
    // port I/O; safe from any context.
    unsafe {
        meson_core::log::set_print_fn(early_serial_print);
        meson_core::log::set_log_fn(early_serial_log);
    }
}

// ---------------------------------------------------------------------------
// Full logger (post-heap)
// ---------------------------------------------------------------------------

struct LoggerInner {
    sinks: Vec<Box<dyn LogSink>>,
}

/// The sink-based kernel logger.
pub struct Logger {
    inner: SpinLock<Option<LoggerInner>>,
}

impl Logger {
    const fn new() -> Self {
        Self {
            inner: SpinLock::new(None),
        }
    }

    fn init_with_serial(&self) {
        {
            let mut guard = self.inner.lock();
            let mut sinks: Vec<Box<dyn LogSink>> = Vec::with_capacity(2);
            sinks.push(Box::new(SerialSink::new(
                Uart16550::new(COM1),
                LogLevel::Trace,
            )));
            *guard = Some(LoggerInner { sinks });
        }
        // SAFETY: The logger functions are callable from any context; they
        // spin on the logger lock at worst.
        unsafe {
            meson_core::log::set_print_fn(logger_print);
            meson_core::log::set_log_fn(logger_log);
        }
    }

    fn add_sink(&self, sink: Box<dyn LogSink>) {
        if let Some(inner) = self.inner.lock().as_mut() {
            inner.sinks.push(sink);
        }
    }

    fn write_fmt(&self, args: fmt::Arguments<'_>) {
        let guard = self.inner.lock();
        if let Some(inner) = guard.as_ref() {
            for sink in &inner.sinks {
                let mut w = SinkWriter(sink.as_ref());
                let _ = fmt::Write::write_fmt(&mut w, args);
            }
        }
    }

    fn log(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        let nanos = crate::time::monotonic_ns();
        let micros = nanos / 1_000;
        let guard = self.inner.lock();
        if let Some(inner) = guard.as_ref() {
            for sink in &inner.sinks {
                if level <= sink.max_level() {
                    let mut w = SinkWriter(sink.as_ref());
                    let _ = write!(
                        w,
                        "[{:>5}.{:06}] {} {}\n",
                        micros / 1_000_000,
                        micros % 1_000_000,
                        level.name(),
                        args
                    );
                }
            }
        }
    }
}

struct SinkWriter<'a>(&'a dyn LogSink);

impl fmt::Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

/// The global logger.
pub static LOGGER: Logger = Logger::new();

fn logger_print(args: fmt::Arguments<'_>) {
    LOGGER.write_fmt(args);
}

fn logger_log(level: LogLevel, args: fmt::Arguments<'_>) {
    LOGGER.log(level, args);
}

/// Switches from early serial to the sink-based logger. Requires the heap.
pub fn init_logger() {
    LOGGER.init_with_serial();
}

/// Registers an additional sink.
pub fn add_sink(sink: Box<dyn LogSink>) {
    LOGGER.add_sink(sink);
}

/// Writes panic output straight to COM1, bypassing every lock. Safe to call
/// while the logger lock is held by the panicking context.
pub fn panic_serial(info: &core::panic::PanicInfo) {
    let mut w = SerialWriter(Uart16550::new(COM1));
    let _ = write!(w, "\n!!! KERNEL PANIC !!!\n{info}\n");
}
