//! Programmable interval timer
//!
//! The scheduler tick source. Only channel 0 in rate-generator mode is
//! used; the frequency governor reprograms the divisor at run time.

use core::sync::atomic::{AtomicU16, Ordering};

use crate::config::DEFAULT_TIMER_FREQ;

/// PIT input clock in Hz.
const PIT_INPUT_HZ: u32 = 1_193_182;

/// Currently programmed tick frequency.
static CURRENT_FREQ: AtomicU16 = AtomicU16::new(DEFAULT_TIMER_FREQ);

/// The tick frequency the PIT was last programmed with.
pub fn current_frequency() -> u16 {
    CURRENT_FREQ.load(Ordering::Relaxed)
}

/// Program channel 0 for periodic interrupts at `hz`.
///
/// Frequencies below ~19 Hz are not representable with a 16-bit divisor
/// and are clamped.
#[cfg(target_os = "none")]
pub fn set_frequency(hz: u16) {
    use x86_64::instructions::port::Port;

    let hz = hz.max(19);
    let divisor = (PIT_INPUT_HZ / hz as u32).min(0xFFFF) as u16;

    let mut cmd: Port<u8> = Port::new(0x43);
    let mut data: Port<u8> = Port::new(0x40);

    // SAFETY: ports 0x43/0x40 are the PIT command and channel-0 data ports;
    // writing mode 0x36 followed by the 16-bit divisor is the documented
    // programming sequence and affects no other device.
    unsafe {
        cmd.write(0x36u8); // channel 0, lobyte/hibyte, rate generator
        data.write((divisor & 0xFF) as u8);
        data.write((divisor >> 8) as u8);
    }

    CURRENT_FREQ.store(hz, Ordering::Relaxed);
}

/// Host builds only record the requested frequency.
#[cfg(not(target_os = "none"))]
pub fn set_frequency(hz: u16) {
    CURRENT_FREQ.store(hz.max(19), Ordering::Relaxed);
}
