//! COM1 serial output
//!
//! All kernel text ends up here: the `log` backend, the `print!` macros and
//! the panic path share the one lazily initialized port.

#[cfg(target_os = "none")]
use core::fmt::{self, Write};

#[cfg(target_os = "none")]
use lazy_static::lazy_static;
#[cfg(target_os = "none")]
use spin::Mutex;

#[cfg(target_os = "none")]
lazy_static! {
    pub static ref SERIAL1: Mutex<uart_16550::SerialPort> = {
        // SAFETY: 0x3F8 is the standard COM1 base; the port is driven only
        // through this mutex.
        let mut port = unsafe { uart_16550::SerialPort::new(0x3F8) };
        port.init();
        Mutex::new(port)
    };
}

#[cfg(target_os = "none")]
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    // Interrupts stay disabled for the write so an ISR printing on the same
    // core cannot deadlock against us.
    x86_64::instructions::interrupts::without_interrupts(|| {
        SERIAL1
            .lock()
            .write_fmt(args)
            .expect("serial write failed");
    });
}

#[cfg(not(target_os = "none"))]
#[doc(hidden)]
pub fn _print(_args: core::fmt::Arguments) {}
