//! VoidFrame kernel binary
//!
//! Boots via `bootloader_api`, brings the core subsystems up in
//! dependency order, unmasks the timer, and parks the boot CPU as the
//! idle process.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
use bootloader_api::{config::Mapping, entry_point, BootInfo, BootloaderConfig};
#[cfg(target_os = "none")]
use voidframe_kernel::{arch, config::DEFAULT_TIMER_FREQ, logger, mm, println, process, sched};

#[cfg(target_os = "none")]
const BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    // The page-table engine reaches every frame through this mapping.
    config.mappings.physical_memory = Some(Mapping::FixedAddress(mm::KERNEL_VIRTUAL_OFFSET));
    config
};

#[cfg(target_os = "none")]
entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

#[cfg(target_os = "none")]
fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    logger::init();
    println!("VoidFrame v{}", env!("CARGO_PKG_VERSION"));

    mm::init(&boot_info.memory_regions);
    #[cfg(feature = "alloc")]
    voidframe_kernel::init_rust_heap();

    process::init();
    sched::init();

    arch::x86_64::interrupts::init();
    arch::x86_64::pit::set_frequency(DEFAULT_TIMER_FREQ);

    log::info!("kernel: boot complete, entering idle");
    sched::run();
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    println!("[KERNEL PANIC] {}", info);
    loop {
        x86_64::instructions::interrupts::disable();
        x86_64::instructions::hlt();
    }
}

// The binary is meaningless on the host; give it an empty main so
// `cargo test` can still build the workspace.
#[cfg(not(target_os = "none"))]
fn main() {}
