//! Process-wide logger, adapted from `queen-core`'s `logging.rs`.
//!
//! The teacher writes colorized, per-CPU-tagged lines straight to a UART.
//! This core has no UART to assume, so the sink is a small trait the host
//! installs; the default sink writes to stderr, which is what every test
//! in this crate observes.

use core::fmt;
use log::{Level, LevelFilter, Log};
use spin::Mutex;
use std::io::Write;

/// Where log lines go. Implemented by the host kernel in production; the
/// default implementation below is enough for hosted tests and examples.
pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str);
}

struct StderrSink;

impl LogSink for StderrSink {
    fn write_line(&self, line: &str) {
        let _ = writeln!(std::io::stderr(), "{line}");
    }
}

static LOG_LOCK: Mutex<()> = Mutex::new(());
static SINK: spin::Once<Box<dyn LogSink>> = spin::Once::new();

/// Installs the process-wide logger. Idempotent: later calls are ignored,
/// matching `log::set_logger`'s own one-shot semantics.
pub fn init(level: LevelFilter) {
    init_with_sink(level, Box::new(StderrSink));
}

/// Installs the logger with a caller-supplied sink (e.g. a UART driver in a
/// real kernel build).
pub fn init_with_sink(level: LevelFilter, sink: Box<dyn LogSink>) {
    SINK.call_once(|| sink);
    static LOGGER: CoreLogger = CoreLogger;
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

struct CoreLogger;

impl Log for CoreLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let _guard = LOG_LOCK.lock();
        if let Some(sink) = SINK.get() {
            let colored = with_color(
                format_args!(
                    "[{:>5}][cpu-{}]: {}",
                    record.level(),
                    current_cpu_id(),
                    record.args()
                ),
                level_to_color_code(record.level()),
            );
            sink.write_line(&colored);
        }
    }

    fn flush(&self) {}
}

thread_local! {
    static CURRENT_CPU: core::cell::Cell<u32> = core::cell::Cell::new(0);
}

/// Records which CPU the calling thread is standing in for, so log lines
/// carry the right `[cpu-N]` tag. A real kernel calls this once per core at
/// boot; tests call it when simulating a specific CPU's tick.
pub fn set_current_cpu(id: u32) {
    CURRENT_CPU.with(|c| c.set(id));
}

fn current_cpu_id() -> u32 {
    CURRENT_CPU.with(|c| c.get())
}

fn with_color(args: fmt::Arguments, color_code: u8) -> String {
    format!("\u{1B}[{color_code}m{args}\u{1B}[0m")
}

fn level_to_color_code(level: Level) -> u8 {
    match level {
        Level::Error => 31, // Red
        Level::Warn => 93,  // BrightYellow
        Level::Info => 34,  // Blue
        Level::Debug => 32, // Green
        Level::Trace => 90, // BrightBlack
    }
}
