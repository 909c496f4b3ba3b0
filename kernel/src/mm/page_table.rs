//! 4-level page-table engine
//!
//! Walks and edits the PML4 → PDPT → PD → PT hierarchy. Missing
//! intermediate tables are created on demand from the frame allocator and
//! recycled through a small cache. Every mutating operation records the
//! touched virtual address in a TLB batch; on exit the batch either issues
//! per-page invalidations or, past a threshold, reloads CR3 wholesale.
//!
//! A single interrupt-safe spinlock serializes all operations; the batch
//! buffer belongs to the lock holder.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::{
    arch::x86_64 as arch,
    mm::{
        self, phys_to_access, pmm, PageFlags, PhysicalAddress, VirtualAddress, VmError,
        HUGE_PAGE_SIZE, PAGE_SIZE,
    },
    sync::SpinLock,
};

/// Entries per table at every level.
pub const ENTRY_COUNT: usize = 512;

/// Bits of a table entry that hold the physical frame address.
const ENTRY_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Single-page invalidations tolerated before a full CR3 reload is cheaper.
const TLB_FULL_FLUSH_THRESHOLD: usize = 8;

/// Capacity of the pending-invalidation batch.
const MAX_TLB_BATCH: usize = 64;

/// Recycled intermediate tables kept for quick reuse.
const TABLE_CACHE_SIZE: usize = 16;

/// Total TLB flush operations, for the statistics dump.
static TLB_FLUSHES: AtomicU64 = AtomicU64::new(0);

/// One 64-bit page-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn is_present(&self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    pub const fn is_huge(&self) -> bool {
        self.0 & PageFlags::HUGE.bits() != 0
    }

    pub fn addr(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 & ENTRY_ADDR_MASK)
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    pub fn set(&mut self, addr: PhysicalAddress, flags: PageFlags) {
        self.0 = (addr.as_u64() & ENTRY_ADDR_MASK) | flags.bits() | PageFlags::PRESENT.bits();
    }

    /// Replace only the flag bits, keeping the frame address.
    pub fn set_flags(&mut self, flags: PageFlags) {
        self.0 = (self.0 & ENTRY_ADDR_MASK) | flags.bits() | PageFlags::PRESENT.bits();
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// A 512-entry table, one frame in size.
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [PageTableEntry; ENTRY_COUNT],
}

impl PageTable {
    pub const fn new() -> Self {
        Self {
            entries: [PageTableEntry::empty(); ENTRY_COUNT],
        }
    }

    pub fn zero(&mut self) {
        for entry in &mut self.entries {
            entry.clear();
        }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Index into the table at a given level (4 = PML4 .. 1 = PT).
pub const fn table_index(vaddr: VirtualAddress, level: u32) -> usize {
    ((vaddr.as_u64() >> (12 + 9 * (level - 1))) & 0x1FF) as usize
}

/// Pending TLB invalidations for the current lock holder.
struct TlbBatch {
    addrs: [u64; MAX_TLB_BATCH],
    count: usize,
}

impl TlbBatch {
    const fn new() -> Self {
        Self {
            addrs: [0; MAX_TLB_BATCH],
            count: 0,
        }
    }

    fn note(&mut self, vaddr: VirtualAddress) {
        if self.count == MAX_TLB_BATCH {
            self.flush();
        }
        self.addrs[self.count] = vaddr.as_u64();
        self.count += 1;
    }

    /// Apply the batch: full reload past the threshold, else per page.
    fn flush(&mut self) {
        if self.count == 0 {
            return;
        }
        if self.count > TLB_FULL_FLUSH_THRESHOLD {
            arch::flush_tlb_all();
        } else {
            for &addr in &self.addrs[..self.count] {
                arch::flush_tlb_page(addr);
            }
        }
        self.count = 0;
        TLB_FLUSHES.fetch_add(1, Ordering::Relaxed);
    }
}

/// Recycled intermediate-table frames.
struct TableCache {
    frames: [PhysicalAddress; TABLE_CACHE_SIZE],
    count: usize,
}

impl TableCache {
    const fn new() -> Self {
        Self {
            frames: [PhysicalAddress::new(0); TABLE_CACHE_SIZE],
            count: 0,
        }
    }

    fn pop(&mut self) -> Option<PhysicalAddress> {
        if self.count == 0 {
            return None;
        }
        self.count -= 1;
        Some(self.frames[self.count])
    }

    /// Returns false when full; the caller frees the frame instead.
    fn push(&mut self, frame: PhysicalAddress) -> bool {
        if self.count == TABLE_CACHE_SIZE {
            return false;
        }
        self.frames[self.count] = frame;
        self.count += 1;
        true
    }
}

/// The engine: root table plus the lock holder's scratch state.
pub struct PageTableEngine {
    pml4: PhysicalAddress,
    tlb: TlbBatch,
    cache: TableCache,
}

/// Access a table frame through the physical-memory mapping.
///
/// # Safety
///
/// `phys` must be the address of a live page-table frame owned by this
/// engine (or the bootstrap tables), and the caller must hold the engine
/// lock so no aliasing mutable reference exists.
unsafe fn table_mut(phys: PhysicalAddress) -> &'static mut PageTable {
    // SAFETY: per the function contract, plus phys_to_access mapping every
    // physical frame at the fixed kernel offset.
    unsafe { &mut *(phys_to_access(phys) as *mut PageTable) }
}

impl PageTableEngine {
    const fn empty() -> Self {
        Self {
            pml4: PhysicalAddress::new(0),
            tlb: TlbBatch::new(),
            cache: TableCache::new(),
        }
    }

    /// Obtain a zeroed frame for an intermediate table.
    fn alloc_table(&mut self) -> Result<PhysicalAddress, VmError> {
        let frame = match self.cache.pop() {
            Some(frame) => frame,
            None => pmm::alloc_frame().map_err(|_| VmError::OutOfMemory)?,
        };
        // SAFETY: the frame was just removed from the pool or cache, so no
        // live mapping references it and the engine lock is held.
        unsafe { table_mut(frame) }.zero();
        Ok(frame)
    }

    /// Retire an intermediate table frame.
    fn retire_table(&mut self, frame: PhysicalAddress) {
        if !self.cache.push(frame) {
            pmm::free_frame(frame);
        }
    }

    /// Step one level down from `table`, optionally creating the next one.
    fn next_table(
        &mut self,
        table: PhysicalAddress,
        vaddr: VirtualAddress,
        level: u32,
        create: bool,
    ) -> Result<Option<PhysicalAddress>, VmError> {
        // SAFETY: `table` comes from the walk rooted at our PML4 and the
        // engine lock is held.
        let entry = &mut unsafe { table_mut(table) }.entries[table_index(vaddr, level)];

        if entry.is_present() {
            return Ok(Some(entry.addr()));
        }
        if !create {
            return Ok(None);
        }

        let new_table = self.alloc_table()?;
        entry.set(new_table, PageFlags::WRITABLE);
        Ok(Some(new_table))
    }

    /// Walk to the page table covering `vaddr`.
    fn walk_to_pt(
        &mut self,
        vaddr: VirtualAddress,
        create: bool,
    ) -> Result<Option<PhysicalAddress>, VmError> {
        let Some(pdpt) = self.next_table(self.pml4, vaddr, 4, create)? else {
            return Ok(None);
        };
        let Some(pd) = self.next_table(pdpt, vaddr, 3, create)? else {
            return Ok(None);
        };
        self.next_table(pd, vaddr, 2, create)
    }

    fn map_page(
        &mut self,
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), VmError> {
        if !vaddr.is_page_aligned() || !paddr.is_page_aligned() {
            return Err(VmError::Misaligned);
        }
        if !vaddr.is_canonical_mappable() || !pmm::is_managed(paddr) {
            return Err(VmError::InvalidAddress);
        }

        let pt = self
            .walk_to_pt(vaddr, true)?
            .ok_or(VmError::OutOfMemory)?;
        // SAFETY: `pt` was produced by the walk under the engine lock.
        let entry = &mut unsafe { table_mut(pt) }.entries[table_index(vaddr, 1)];
        if entry.is_present() {
            return Err(VmError::AlreadyMapped);
        }
        entry.set(paddr, flags);
        self.tlb.note(vaddr);
        Ok(())
    }

    fn map_huge_page(
        &mut self,
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), VmError> {
        if !vaddr.is_huge_aligned() || paddr.as_u64() & (HUGE_PAGE_SIZE - 1) != 0 {
            return Err(VmError::Misaligned);
        }
        if !vaddr.is_canonical_mappable() || !pmm::is_managed(paddr) {
            return Err(VmError::InvalidAddress);
        }

        let pdpt = self
            .next_table(self.pml4, vaddr, 4, true)?
            .ok_or(VmError::OutOfMemory)?;
        let pd = self
            .next_table(pdpt, vaddr, 3, true)?
            .ok_or(VmError::OutOfMemory)?;
        // SAFETY: `pd` was produced by the walk under the engine lock.
        let entry = &mut unsafe { table_mut(pd) }.entries[table_index(vaddr, 2)];
        if entry.is_present() {
            return Err(VmError::AlreadyMapped);
        }
        entry.set(paddr, flags | PageFlags::HUGE);
        self.tlb.note(vaddr);
        Ok(())
    }

    /// Clear every present mapping in `[vaddr, vaddr + size)`. Walks
    /// without creating; holes are skipped. Returns the number of 4 KiB
    /// page slots released.
    fn unmap_range(&mut self, vaddr: VirtualAddress, size: u64) -> u64 {
        let start = mm::align_down(vaddr.as_u64(), PAGE_SIZE);
        let end = mm::align_up(vaddr.as_u64() + size, PAGE_SIZE);
        let mut released = 0;

        let mut addr = start;
        while addr < end {
            let vaddr = VirtualAddress::new(addr);

            let Ok(Some(pdpt)) = self.next_table(self.pml4, vaddr, 4, false) else {
                addr += PAGE_SIZE;
                continue;
            };
            let Ok(Some(pd)) = self.next_table(pdpt, vaddr, 3, false) else {
                addr += PAGE_SIZE;
                continue;
            };

            // SAFETY: `pd` was produced by the walk under the engine lock.
            let pd_entry = &mut unsafe { table_mut(pd) }.entries[table_index(vaddr, 2)];
            if pd_entry.is_present() && pd_entry.is_huge() {
                if vaddr.is_huge_aligned() && end - addr >= HUGE_PAGE_SIZE {
                    pd_entry.clear();
                    self.tlb.note(vaddr);
                    released += HUGE_PAGE_SIZE / PAGE_SIZE;
                    addr += HUGE_PAGE_SIZE;
                    continue;
                }
                // A partial hole in a huge mapping cannot be represented.
                addr += PAGE_SIZE;
                continue;
            }

            if let Some(pt) = pd_entry.is_present().then(|| pd_entry.addr()) {
                // SAFETY: `pt` is the present PT just read under the lock.
                let entry = &mut unsafe { table_mut(pt) }.entries[table_index(vaddr, 1)];
                if entry.is_present() {
                    entry.clear();
                    self.tlb.note(vaddr);
                    released += 1;
                }
            }
            addr += PAGE_SIZE;
        }

        self.tlb.flush();
        released
    }

    /// Read-only walk honoring huge-page entries.
    fn translate(&mut self, vaddr: VirtualAddress) -> Option<PhysicalAddress> {
        let pdpt = self.next_table(self.pml4, vaddr, 4, false).ok()??;
        let pd = self.next_table(pdpt, vaddr, 3, false).ok()??;

        // SAFETY: `pd` was produced by the walk under the engine lock.
        let pd_entry = unsafe { table_mut(pd) }.entries[table_index(vaddr, 2)];
        if !pd_entry.is_present() {
            return None;
        }
        if pd_entry.is_huge() {
            let base = pd_entry.addr().as_u64() & !(HUGE_PAGE_SIZE - 1);
            return Some(PhysicalAddress::new(
                base | (vaddr.as_u64() & (HUGE_PAGE_SIZE - 1)),
            ));
        }

        // SAFETY: the PD entry is present and not huge, so it names a PT.
        let entry = unsafe { table_mut(pd_entry.addr()) }.entries[table_index(vaddr, 1)];
        if !entry.is_present() {
            return None;
        }
        Some(PhysicalAddress::new(
            entry.addr().as_u64() | (vaddr.as_u64() & (PAGE_SIZE - 1)),
        ))
    }

    /// Rewrite the flag bits of an existing 4 KiB mapping.
    fn update_flags(&mut self, vaddr: VirtualAddress, flags: PageFlags) -> Result<(), VmError> {
        let pt = self
            .walk_to_pt(vaddr, false)?
            .ok_or(VmError::NotMapped)?;
        // SAFETY: `pt` was produced by the walk under the engine lock.
        let entry = &mut unsafe { table_mut(pt) }.entries[table_index(vaddr, 1)];
        if !entry.is_present() {
            return Err(VmError::NotMapped);
        }
        entry.set_flags(flags);
        self.tlb.note(vaddr);
        self.tlb.flush();
        Ok(())
    }
}

/// Global engine; lock order places it between the virtual allocator and
/// the physical allocator.
static ENGINE: SpinLock<PageTableEngine> = SpinLock::new(PageTableEngine::empty());

/// Map one 4 KiB page.
pub fn map(vaddr: VirtualAddress, paddr: PhysicalAddress, flags: PageFlags) -> Result<(), VmError> {
    let mut engine = ENGINE.lock();
    let result = engine.map_page(vaddr, paddr, flags);
    engine.tlb.flush();
    result
}

/// Map one 2 MiB page directly in the PD.
pub fn map_huge(
    vaddr: VirtualAddress,
    paddr: PhysicalAddress,
    flags: PageFlags,
) -> Result<(), VmError> {
    let mut engine = ENGINE.lock();
    let result = engine.map_huge_page(vaddr, paddr, flags);
    engine.tlb.flush();
    result
}

/// Map a physically contiguous MMIO window; cache-disable and
/// write-through are forced regardless of `flags`. Physical-ceiling
/// validation is skipped: device BARs live outside RAM.
pub fn map_mmio(
    vaddr: VirtualAddress,
    paddr: PhysicalAddress,
    size: u64,
    flags: PageFlags,
) -> Result<(), VmError> {
    if !vaddr.is_page_aligned() || !paddr.is_page_aligned() || size & (PAGE_SIZE - 1) != 0 {
        return Err(VmError::Misaligned);
    }
    if !vaddr.is_canonical_mappable() {
        return Err(VmError::InvalidAddress);
    }

    let mmio_flags = flags | PageFlags::mmio();
    let mut engine = ENGINE.lock();

    let pages = size / PAGE_SIZE;
    for i in 0..pages {
        let va = VirtualAddress::new(vaddr.as_u64() + i * PAGE_SIZE);
        let pa = PhysicalAddress::new(paddr.as_u64() + i * PAGE_SIZE);

        let mapped = engine.walk_to_pt(va, true).and_then(|pt| {
            let pt = pt.ok_or(VmError::OutOfMemory)?;
            // SAFETY: `pt` was produced by the walk under the engine lock.
            let entry = &mut unsafe { table_mut(pt) }.entries[table_index(va, 1)];
            if entry.is_present() {
                return Err(VmError::AlreadyMapped);
            }
            entry.set(pa, mmio_flags);
            engine.tlb.note(va);
            Ok(())
        });

        if let Err(e) = mapped {
            // No partial windows: tear down what was already mapped.
            engine.unmap_range(vaddr, i * PAGE_SIZE);
            engine.tlb.flush();
            return Err(e);
        }
    }

    engine.tlb.flush();
    Ok(())
}

/// Remove an MMIO window. The backing is device memory, so no frames are
/// returned to the pool.
pub fn unmap_mmio(vaddr: VirtualAddress, size: u64) {
    ENGINE.lock().unmap_range(vaddr, size);
}

/// Clear present mappings over the range; returns released page slots.
pub fn unmap(vaddr: VirtualAddress, size: u64) -> u64 {
    ENGINE.lock().unmap_range(vaddr, size)
}

/// Virtual-to-physical query.
pub fn translate(vaddr: VirtualAddress) -> Option<PhysicalAddress> {
    ENGINE.lock().translate(vaddr)
}

/// Rewrite the flags of an existing mapping.
pub fn set_flags(vaddr: VirtualAddress, flags: PageFlags) -> Result<(), VmError> {
    ENGINE.lock().update_flags(vaddr, flags)
}

/// Total TLB flush operations issued so far.
pub fn tlb_flush_count() -> u64 {
    TLB_FLUSHES.load(Ordering::Relaxed)
}

/// Adopt the bootstrap PML4 as the kernel address space root.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn init() {
    let pml4 = PhysicalAddress::new(arch::current_pml4());
    ENGINE.lock().pml4 = pml4;
    log::info!("page tables: rooted at PML4 {:#x}", pml4.as_u64());
}

/// Physical address of the kernel PML4.
pub fn kernel_pml4() -> PhysicalAddress {
    ENGINE.lock().pml4
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn entry_roundtrip_preserves_addr_and_flags() {
        let mut entry = PageTableEntry::empty();
        entry.set(
            PhysicalAddress::new(0x1234_5000),
            PageFlags::WRITABLE | PageFlags::NO_CACHE,
        );
        assert!(entry.is_present());
        assert!(!entry.is_huge());
        assert_eq!(entry.addr().as_u64(), 0x1234_5000);
        assert!(entry.flags().contains(PageFlags::NO_CACHE));

        entry.set_flags(PageFlags::WRITABLE);
        assert_eq!(entry.addr().as_u64(), 0x1234_5000);
        assert!(!entry.flags().contains(PageFlags::NO_CACHE));
    }

    #[test]
    fn huge_bit_is_visible() {
        let mut entry = PageTableEntry::empty();
        entry.set(
            PhysicalAddress::new(HUGE_PAGE_SIZE),
            PageFlags::WRITABLE | PageFlags::HUGE,
        );
        assert!(entry.is_huge());
    }

    #[test]
    fn table_indices_split_the_address() {
        let vaddr = VirtualAddress::new(0xFFFF_8012_3456_7000);
        for level in 1..=4 {
            assert!(table_index(vaddr, level) < ENTRY_COUNT);
        }
        // Consecutive pages differ only in the level-1 index.
        let a = VirtualAddress::new(0x40_0000);
        let b = VirtualAddress::new(0x40_1000);
        assert_eq!(table_index(a, 2), table_index(b, 2));
        assert_eq!(table_index(a, 1) + 1, table_index(b, 1));
    }

    #[test]
    fn tlb_batch_spills_into_flush() {
        let mut batch = TlbBatch::new();
        for i in 0..MAX_TLB_BATCH {
            batch.note(VirtualAddress::new((i as u64) << 12));
        }
        assert_eq!(batch.count, MAX_TLB_BATCH);
        // One more forces an intermediate flush.
        batch.note(VirtualAddress::new(0xdead_0000));
        assert_eq!(batch.count, 1);
        batch.flush();
        assert_eq!(batch.count, 0);
    }

    #[test]
    fn table_cache_bounds() {
        let mut cache = TableCache::new();
        for i in 0..TABLE_CACHE_SIZE {
            assert!(cache.push(PhysicalAddress::new((i as u64 + 1) << 12)));
        }
        assert!(!cache.push(PhysicalAddress::new(0xFFFF_F000)));
        let top = cache.pop().expect("cache holds entries");
        assert_eq!(top.as_u64(), (TABLE_CACHE_SIZE as u64) << 12);
    }
}
