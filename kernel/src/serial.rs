//! Serial output
//!
//! On bare-metal x86_64 the kernel log goes to COM1 (UART 16550 @ 0x3F8).
//! Hosted builds have no UART; output is handed to an optional sink
//! installed with [`set_sink`] and dropped otherwise.

use core::fmt;
use spin::Mutex;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
lazy_static::lazy_static! {
    static ref SERIAL1: Mutex<uart_16550::SerialPort> = {
        let mut port = unsafe { uart_16550::SerialPort::new(0x3F8) };
        port.init();
        Mutex::new(port)
    };
}

/// Host-side receiver for kernel output
pub type Sink = fn(fmt::Arguments);

static SINK: Mutex<Option<Sink>> = Mutex::new(None);

/// Route kernel output to `sink` (or nowhere)
pub fn set_sink(sink: Option<Sink>) {
    *SINK.lock() = sink;
}

/// Print to serial port (internal use)
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        use core::fmt::Write;
        // Disable interrupts to prevent deadlock, then write
        x86_64::instructions::interrupts::without_interrupts(|| {
            let _ = SERIAL1.lock().write_fmt(args);
        });
    }

    let sink = *SINK.lock();
    if let Some(sink) = sink {
        sink(args);
    }
}

/// Print to serial port
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}
