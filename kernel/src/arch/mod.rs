//! Architecture support
//!
//! VoidFrame targets x86-64 only; everything hardware-shaped funnels through
//! this module so the rest of the kernel stays portable in structure.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use x86_64::context::RegisterFrame;

/// Sleep until the next interrupt. `sti; hlt` as one unit, so a wake-up
/// between the two instructions cannot be lost.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn halt() {
    ::x86_64::instructions::interrupts::enable_and_hlt();
}

/// Host builds have nothing to halt; yield the thread instead so the
/// scheduler tests that spin on `halt` terminate.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn halt() {
    core::hint::spin_loop();
}
