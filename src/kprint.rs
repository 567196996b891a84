//! Console print utilities.
//!
//! The crate is freestanding; it does not assume a standard output. An
//! embedder (or a test) installs a console sink with [`set_console`] and
//! the macros below write through it. Without a sink, messages are
//! dropped.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

static CONSOLE: Mutex<Option<Box<dyn core::fmt::Write + Send>>> = Mutex::new(None);

/// Suppresses `info!` and `debug!` output when set.
pub static QUIET: AtomicBool = AtomicBool::new(false);

/// Install the console sink the print macros write through.
pub fn set_console(sink: Box<dyn core::fmt::Write + Send>) {
    *CONSOLE.lock() = Some(sink);
}

/// Remove the installed console sink, if any.
pub fn clear_console() {
    *CONSOLE.lock() = None;
}

/// Suppress or re-enable `info!` and `debug!` output.
pub fn set_quiet(quiet: bool) {
    QUIET.store(quiet, Ordering::SeqCst);
}

#[doc(hidden)]
pub fn _print(fmt: core::fmt::Arguments<'_>) {
    if let Some(sink) = CONSOLE.lock().as_mut() {
        let _ = sink.write_fmt(fmt);
    }
}

#[doc(hidden)]
pub fn _quiet() -> bool {
    QUIET.load(Ordering::SeqCst)
}

/// Prints out the message.
///
/// Use the format! syntax to write data to the installed console sink.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::kprint::_print(format_args!($($arg)*)));
}

/// Prints out the message with a newline.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Display an information message.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => (if !$crate::kprint::_quiet() { $crate::print!("[INFO] {}\n", format_args!($($arg)*)) });
}

/// Display a warning message.
#[macro_export]
macro_rules! warning {
    ($($arg:tt)*) => ($crate::print!("[WARN] {}\n", format_args!($($arg)*)));
}

/// Display a debugging message.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => (if !$crate::kprint::_quiet() { $crate::print!("[DEBUG] {}\n", format_args!($($arg)*)) });
}
