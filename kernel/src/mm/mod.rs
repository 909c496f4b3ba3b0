//! Memory management
//!
//! Four layers, bottom up: the physical frame allocator (`pmm`), the
//! 4-level page-table engine (`page_table`), the buddy virtual-address
//! allocator (`vmm`), and the kernel heap (`heap`). Each layer only calls
//! downward, and each global is guarded by its own interrupt-safe spinlock.

pub mod heap;
pub mod page_table;
pub mod pmm;
pub mod vmm;

use bitflags::bitflags;

/// Size of a page / physical frame.
pub const PAGE_SIZE: u64 = 4096;
pub const PAGE_SHIFT: u64 = 12;

/// Size of a 2 MiB huge page.
pub const HUGE_PAGE_SIZE: u64 = 2 * 1024 * 1024;
pub const HUGE_PAGE_SHIFT: u64 = 21;

/// Virtual offset at which the bootloader maps all physical memory.
pub const KERNEL_VIRTUAL_OFFSET: u64 = 0xFFFF_FE00_0000_0000;

// Dual-region layout: the whole lower canonical half (minus the null page)
// and the higher canonical half below the kernel's 2 TiB window are handed
// to the virtual allocator.
pub const LOW_REGION_START: u64 = 0x0000_0000_0000_1000;
pub const LOW_REGION_END: u64 = 0x0000_7FFF_FFFF_FFFF;
pub const HIGH_REGION_START: u64 = 0xFFFF_8000_0000_0000;
pub const HIGH_REGION_END: u64 = 0xFFFF_FDFF_FFFF_FFFF;
pub const KERNEL_SPACE_START: u64 = KERNEL_VIRTUAL_OFFSET;

/// Physical memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn frame_number(&self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }
}

/// Virtual memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }

    pub const fn is_huge_aligned(&self) -> bool {
        self.0 & (HUGE_PAGE_SIZE - 1) == 0
    }

    /// Inside one of the regions the kernel may map into.
    pub const fn is_canonical_mappable(&self) -> bool {
        let a = self.0;
        (a >= LOW_REGION_START && a <= LOW_REGION_END)
            || (a >= HIGH_REGION_START && a <= HIGH_REGION_END)
            || a >= KERNEL_SPACE_START
    }
}

pub const fn align_down(addr: u64, align: u64) -> u64 {
    addr & !(align - 1)
}

pub const fn align_up(addr: u64, align: u64) -> u64 {
    (addr + align - 1) & !(align - 1)
}

bitflags! {
    /// Page-table entry flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const HUGE          = 1 << 7;
        const GLOBAL        = 1 << 8;
        const NO_EXECUTE    = 1 << 63;
    }
}

impl PageFlags {
    /// Flags for ordinary writable kernel data.
    pub const fn kernel_data() -> Self {
        Self::PRESENT.union(Self::WRITABLE)
    }

    /// Flags forced onto every MMIO mapping.
    pub const fn mmio() -> Self {
        Self::PRESENT
            .union(Self::WRITABLE)
            .union(Self::NO_CACHE)
            .union(Self::WRITE_THROUGH)
    }
}

/// Result codes shared by the page-table engine and virtual allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// A physical frame or virtual range could not be obtained.
    OutOfMemory,
    /// Address outside the mappable canonical ranges or physical ceiling.
    InvalidAddress,
    /// The target PTE is already present.
    AlreadyMapped,
    /// No mapping exists where one was required.
    NotMapped,
    /// An address violated the required alignment.
    Misaligned,
    /// The virtual allocator has no space left for the request.
    NoVirtualSpace,
}

impl VmError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OutOfMemory => "out of physical memory",
            Self::InvalidAddress => "invalid address",
            Self::AlreadyMapped => "already mapped",
            Self::NotMapped => "not mapped",
            Self::Misaligned => "misaligned address",
            Self::NoVirtualSpace => "virtual address space exhausted",
        }
    }
}

impl core::fmt::Display for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Virtual address through which a physical address can be dereferenced,
/// via the bootloader's full physical mapping at `KERNEL_VIRTUAL_OFFSET`.
pub fn phys_to_access(paddr: PhysicalAddress) -> u64 {
    paddr.as_u64() + KERNEL_VIRTUAL_OFFSET
}

/// Initialize all four layers from the boot memory map.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn init(memory_regions: &bootloader_api::info::MemoryRegions) {
    pmm::init(memory_regions);
    page_table::init();
    vmm::init();
    heap::init();
    log::info!(
        "mm: online, {} of {} frames free",
        pmm::free_frames(),
        pmm::total_frames()
    );
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(1, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_up(PAGE_SIZE, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_down(PAGE_SIZE + 1, PAGE_SIZE), PAGE_SIZE);
        assert!(VirtualAddress::new(0x2000).is_page_aligned());
        assert!(!VirtualAddress::new(0x2001).is_page_aligned());
    }

    #[test]
    fn canonical_ranges() {
        assert!(VirtualAddress::new(LOW_REGION_START).is_canonical_mappable());
        assert!(VirtualAddress::new(HIGH_REGION_END).is_canonical_mappable());
        assert!(VirtualAddress::new(KERNEL_VIRTUAL_OFFSET).is_canonical_mappable());
        // The non-canonical hole is rejected.
        assert!(!VirtualAddress::new(0x0000_8000_0000_0000).is_canonical_mappable());
        assert!(!VirtualAddress::new(0).is_canonical_mappable());
    }

    #[test]
    fn mmio_flags_force_uncached_writethrough() {
        let flags = PageFlags::mmio();
        assert!(flags.contains(PageFlags::NO_CACHE));
        assert!(flags.contains(PageFlags::WRITE_THROUGH));
    }
}
