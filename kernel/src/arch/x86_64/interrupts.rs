//! Interrupt entry plumbing
//!
//! The assembly trampolines below are the only code in the kernel that
//! knows the `RegisterFrame` layout by offset. Each one materializes the
//! frame on the interrupted stack, hands a pointer to the Rust handler,
//! then unwinds the frame and `iretq`s into whatever context the handler
//! left behind — which is how a context switch leaves the ISR.

use core::arch::global_asm;

use lazy_static::lazy_static;
use pic8259::ChainedPics;
use x86_64::structures::idt::InterruptDescriptorTable;

use super::context::RegisterFrame;
use crate::sync::SpinLock;

/// Vector the PIT fires on after PIC remapping.
pub const TIMER_VECTOR: u8 = 32;
/// Software interrupt vector of the system-call surface.
pub const SYSCALL_VECTOR: u8 = 0x80;

pub static PICS: SpinLock<ChainedPics> =
    // SAFETY: 32/40 are the canonical remap offsets, clear of CPU
    // exception vectors; nothing else programs the PICs.
    SpinLock::new(unsafe { ChainedPics::new(32, 40) });

// Both stubs build the same frame: the CPU pushed ss..rip, the stub adds a
// dummy error code, the vector number, space for the segment selector
// snapshot, then the GPRs in rax-first order so r15 lands at the lowest
// address. rax is spilled before the selectors are read through it.
macro_rules! trampoline_asm {
    ($name:literal, $vector:literal, $handler:literal) => {
        global_asm!(concat!(
            ".global ", $name, "\n",
            $name, ":\n",
            "    push 0\n",
            "    push ", $vector, "\n",
            "    sub rsp, 32\n",
            "    push rax\n",
            "    push rcx\n",
            "    push rdx\n",
            "    push rbx\n",
            "    push rbp\n",
            "    push rsi\n",
            "    push rdi\n",
            "    push r8\n",
            "    push r9\n",
            "    push r10\n",
            "    push r11\n",
            "    push r12\n",
            "    push r13\n",
            "    push r14\n",
            "    push r15\n",
            "    xor rax, rax\n",
            "    mov ax, ds\n",
            "    mov [rsp + 120], rax\n",
            "    mov ax, es\n",
            "    mov [rsp + 128], rax\n",
            "    mov ax, fs\n",
            "    mov [rsp + 136], rax\n",
            "    mov ax, gs\n",
            "    mov [rsp + 144], rax\n",
            "    mov rdi, rsp\n",
            "    call ", $handler, "\n",
            "    pop r15\n",
            "    pop r14\n",
            "    pop r13\n",
            "    pop r12\n",
            "    pop r11\n",
            "    pop r10\n",
            "    pop r9\n",
            "    pop r8\n",
            "    pop rdi\n",
            "    pop rsi\n",
            "    pop rbp\n",
            "    pop rbx\n",
            "    pop rdx\n",
            "    pop rcx\n",
            "    pop rax\n",
            "    add rsp, 48\n",
            "    iretq\n",
        ));
    };
}

trampoline_asm!("timer_interrupt_stub", "32", "timer_interrupt_handler");
trampoline_asm!("syscall_interrupt_stub", "0x80", "syscall_interrupt_handler");

extern "C" {
    fn timer_interrupt_stub();
    fn syscall_interrupt_stub();
}

/// Rust side of the timer tick: drive the scheduler, then EOI.
#[no_mangle]
extern "C" fn timer_interrupt_handler(frame: &mut RegisterFrame) {
    crate::sched::scheduler_tick(frame);

    // SAFETY: we are completing the interrupt this vector delivered;
    // notifying end-of-interrupt for it is the required PIC protocol.
    unsafe { PICS.lock().notify_end_of_interrupt(TIMER_VECTOR) };
}

/// Rust side of `int 0x80`: rax/rdi/rsi/rdx in, result in rax.
#[no_mangle]
extern "C" fn syscall_interrupt_handler(frame: &mut RegisterFrame) {
    frame.rax = crate::syscall::dispatch(frame.rax, frame.rdi, frame.rsi, frame.rdx, frame);
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        // SAFETY: both stubs are the matching trampolines defined above;
        // they preserve the full register state and end in iretq.
        unsafe {
            idt[TIMER_VECTOR]
                .set_handler_addr(x86_64::VirtAddr::new(timer_interrupt_stub as usize as u64));
            idt[SYSCALL_VECTOR]
                .set_handler_addr(x86_64::VirtAddr::new(syscall_interrupt_stub as usize as u64));
        }
        idt
    };
}

/// Load the IDT and bring the PICs up with everything but the timer masked.
pub fn init() {
    IDT.load();

    let mut pics = PICS.lock();
    // SAFETY: standard 8259 bring-up; the remap offsets were fixed at
    // construction and the masks only gate delivery.
    unsafe {
        pics.initialize();
        pics.write_masks(0xFE, 0xFF); // IRQ0 (timer) only
    }
}
