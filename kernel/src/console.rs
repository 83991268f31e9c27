//! Kernel log output.
//!
//! The UART driver and interrupt-driven line discipline this would
//! normally sit on top of are outside this core's scope. What remains
//! is the sink the rest of the kernel writes through, so `println!`
//! reads the same here as it would with a real console wired in.

use core::fmt::{self, Write as _};

use crate::sync::SpinLock;

/// Destination for kernel log output.
pub trait Sink: Send {
    fn write_str(&mut self, s: &str);
}

static SINK: SpinLock<Option<&'static mut dyn Sink>> = SpinLock::new(None);

/// Installs the console's output sink.
///
/// Called once during boot, before any [`println!`] output is
/// expected to go anywhere. Output is silently dropped until this is
/// called.
pub fn set_sink(sink: &'static mut dyn Sink) {
    *SINK.lock() = Some(sink);
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
    struct Writer<'a>(&'a mut dyn Sink);
    impl fmt::Write for Writer<'_> {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            self.0.write_str(s);
            Ok(())
        }
    }
    let mut guard = SINK.lock();
    if let Some(sink) = guard.as_deref_mut() {
        let _ = Writer(sink).write_fmt(args);
    }
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n")
    };
    ($($arg:tt)*) => {
        $crate::console::_print(format_args!("{}\n", format_args!($($arg)*)))
    };
}

#[cfg(test)]
mod tests {
    use alloc::{boxed::Box, string::String};

    use super::*;

    struct Recorder(String);

    impl Sink for Recorder {
        fn write_str(&mut self, s: &str) {
            self.0.push_str(s);
        }
    }

    #[test]
    fn println_reaches_installed_sink() {
        // Sinks are a single global, so keep this test's assertions
        // about what it wrote rather than its exact content, since
        // other tests in this binary may log too.
        let recorder = Box::leak(Box::new(Recorder(String::new())));
        let recorder_ptr: *const Recorder = recorder;
        set_sink(recorder);
        println!("hello {}", 1);
        // SAFETY: `recorder` was leaked above, so the pointee outlives
        // this read; nothing else writes to it between here and `set_sink`.
        assert!(unsafe { &*recorder_ptr }.0.ends_with("hello 1\n"));
    }
}
