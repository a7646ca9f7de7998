//! The kernel console: the narrow interface core subsystems are allowed to
//! depend on for text output.
//!
//! VGA/framebuffer rendering is an external collaborator (`spec.md` §1,
//! Out of scope) — this module does not implement it. It defines the trait
//! a rendering backend would satisfy, and ships one always-available
//! implementation (serial) so boot diagnostics, `panic.rs`, and the `WRITE`
//! syscall have somewhere to write before any display driver attaches.

use core::fmt::{self, Write};

use spin::Mutex;

/// A sink for kernel text output.
///
/// A VGA/framebuffer console plugs in by implementing this trait; the core
/// kernel never depends on a concrete rendering backend.
pub trait KernelConsole: Send {
    /// Write a string to the console. Never fails: a console backend that
    /// can drop output (e.g. a full ring buffer) does so silently rather
    /// than propagating an error into kernel control flow.
    fn write_str(&mut self, s: &str);
}

/// Default backend: mirrors everything to the serial diagnostic channel.
pub struct SerialConsole;

impl KernelConsole for SerialConsole {
    fn write_str(&mut self, s: &str) {
        crate::serial_print!("{}", s);
    }
}

static ACTIVE: Mutex<SerialConsole> = Mutex::new(SerialConsole);

/// Write a string to the currently active kernel console.
pub fn write_str(s: &str) {
    let mut console = ACTIVE.lock();
    KernelConsole::write_str(&mut *console, s);
}

/// Write formatted arguments to the currently active kernel console.
pub fn write_fmt(args: fmt::Arguments) {
    struct Adapter;
    impl Write for Adapter {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            write_str(s);
            Ok(())
        }
    }
    #[expect(clippy::unwrap_used, reason = "Adapter::write_str never fails.")]
    Adapter.write_fmt(args).unwrap();
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    write_fmt(args);
}

/// Print to the kernel console.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::_print(format_args!($($arg)*))
    };
}

/// Print a line to the kernel console.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn write_str_does_not_panic() {
        write_str("console smoke test\n");
    }
}
