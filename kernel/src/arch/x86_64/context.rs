//! Interrupt register frame
//!
//! The layout below is bit-exact with what the interrupt entry stub pushes:
//! general-purpose registers r15 down to rax, the data segment selectors,
//! the interrupt number and error code, then the hardware-pushed tail
//! (rip, cs, rflags, rsp, ss). The entry/exit trampoline in
//! `arch::x86_64::interrupts` is the only code allowed to assume this
//! layout; everything else treats it as an opaque snapshot.

/// Saved CPU state at interrupt entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,

    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,

    pub interrupt_number: u64,
    pub error_code: u64,

    // Pushed by the CPU on interrupt entry.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Kernel code segment selector.
pub const KERNEL_CS: u64 = 0x08;
/// Kernel data segment selector.
pub const KERNEL_DS: u64 = 0x10;
/// RFLAGS with IF set plus the always-one reserved bit.
pub const INITIAL_RFLAGS: u64 = 0x202;

impl RegisterFrame {
    /// An all-zero frame; slots are stamped with one before first dispatch.
    pub const fn zeroed() -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rdi: 0,
            rsi: 0,
            rbp: 0,
            rbx: 0,
            rdx: 0,
            rcx: 0,
            rax: 0,
            ds: KERNEL_DS,
            es: KERNEL_DS,
            fs: 0,
            gs: 0,
            interrupt_number: 0,
            error_code: 0,
            rip: 0,
            cs: KERNEL_CS,
            rflags: INITIAL_RFLAGS,
            rsp: 0,
            ss: KERNEL_DS,
        }
    }

    /// Initial frame for a fresh kernel process: execution starts at
    /// `entry` on `stack_top` with interrupts enabled.
    pub fn kernel_entry(entry: u64, stack_top: u64) -> Self {
        let mut frame = Self::zeroed();
        frame.rip = entry;
        frame.rsp = stack_top;
        frame
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn frame_matches_stub_layout() {
        // The asm stub indexes the frame by fixed offsets; a field
        // reordering would corrupt every context switch.
        assert_eq!(core::mem::size_of::<RegisterFrame>(), 26 * 8);
        assert_eq!(core::mem::offset_of!(RegisterFrame, r15), 0);
        assert_eq!(core::mem::offset_of!(RegisterFrame, rax), 14 * 8);
        assert_eq!(core::mem::offset_of!(RegisterFrame, interrupt_number), 19 * 8);
        assert_eq!(core::mem::offset_of!(RegisterFrame, rip), 21 * 8);
        assert_eq!(core::mem::offset_of!(RegisterFrame, ss), 25 * 8);
    }

    #[test]
    fn kernel_entry_frame_defaults() {
        let frame = RegisterFrame::kernel_entry(0x1000, 0x8000);
        assert_eq!(frame.rip, 0x1000);
        assert_eq!(frame.rsp, 0x8000);
        assert_eq!(frame.rflags, INITIAL_RFLAGS);
        assert_eq!(frame.cs, KERNEL_CS);
        assert_eq!(frame.ss, KERNEL_DS);
    }
}
