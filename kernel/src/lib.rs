//! VoidFrame kernel library
//!
//! The kernel core: physical and virtual memory management, the MLFQ
//! scheduler with its security token subsystem, process lifecycle, and
//! IPC. Built `no_std` for the bare-metal target; on the host the same
//! modules compile against the standard test harness so the logic-heavy
//! parts run as ordinary unit tests.

#![no_std]

// Host target: use the system allocator so unit tests can allocate
// normally.
#[cfg(not(target_os = "none"))]
extern crate std;

// Bare metal: the Rust `alloc` runtime is backed by a linked-list heap
// carved out of the virtual allocator at init.
#[cfg(all(feature = "alloc", target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: linked_list_allocator::LockedHeap = linked_list_allocator::LockedHeap::empty();

#[macro_use]
pub mod print;

pub mod arch;
pub mod config;
pub mod ipc;
pub mod logger;
pub mod mm;
pub mod process;
pub mod sched;
pub mod security;
pub mod serial;
pub mod sync;
pub mod syscall;

/// Wire the Rust `alloc` runtime to a region from the virtual allocator.
#[cfg(all(feature = "alloc", target_arch = "x86_64", target_os = "none"))]
pub fn init_rust_heap() {
    const RUST_HEAP_SIZE: u64 = 1024 * 1024;

    let base = mm::vmm::alloc(RUST_HEAP_SIZE).expect("rust heap region must exist");
    // SAFETY: the region was just mapped and is handed to the allocator
    // for its exclusive use.
    unsafe {
        ALLOCATOR
            .lock()
            .init(base.as_u64() as *mut u8, RUST_HEAP_SIZE as usize);
    }
    log::info!("alloc: {} KiB rust heap", RUST_HEAP_SIZE / 1024);
}
