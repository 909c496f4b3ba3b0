//! x86-64 architecture support

pub mod context;
pub mod pit;

#[cfg(target_os = "none")]
pub mod interrupts;

/// Reload CR3 with its current value, flushing the entire TLB.
#[cfg(target_os = "none")]
pub fn flush_tlb_all() {
    use x86_64::registers::control::Cr3;

    let (frame, flags) = Cr3::read();
    // SAFETY: writing back the value just read from CR3 changes no mapping;
    // the only architectural effect is the TLB flush we want.
    unsafe { Cr3::write(frame, flags) };
}

/// Invalidate the TLB entry covering one virtual address.
#[cfg(target_os = "none")]
pub fn flush_tlb_page(vaddr: u64) {
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(vaddr));
}

/// Physical address of the active PML4.
#[cfg(target_os = "none")]
pub fn current_pml4() -> u64 {
    use x86_64::registers::control::Cr3;

    Cr3::read().0.start_address().as_u64()
}

/// Load a new PML4, switching address spaces.
///
/// # Safety
///
/// `pml4_phys` must be the physical address of a valid, 4 KiB aligned PML4
/// whose kernel half maps the currently executing code and stack.
#[cfg(target_os = "none")]
pub unsafe fn write_pml4(pml4_phys: u64) {
    use x86_64::{
        registers::control::{Cr3, Cr3Flags},
        structures::paging::PhysFrame,
        PhysAddr,
    };

    let frame = PhysFrame::containing_address(PhysAddr::new(pml4_phys));
    // SAFETY: delegated to the caller per this function's contract.
    unsafe { Cr3::write(frame, Cr3Flags::empty()) };
}

// Host-build stand-ins so the memory manager's bookkeeping paths compile
// and run under the standard test harness. They touch no hardware.
#[cfg(not(target_os = "none"))]
pub fn flush_tlb_all() {}
#[cfg(not(target_os = "none"))]
pub fn flush_tlb_page(_vaddr: u64) {}
#[cfg(not(target_os = "none"))]
pub fn current_pml4() -> u64 {
    0
}
