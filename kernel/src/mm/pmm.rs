//! Physical frame allocator
//!
//! A first-fit bitmap over 4 KiB frames with a scan hint. One bit per
//! frame, 1 = free. The low megabyte and the kernel image are marked used
//! at init and never re-enter the pool. Double-freeing a frame is
//! structural corruption and panics.

use crate::{
    mm::{PhysicalAddress, PAGE_SHIFT, PAGE_SIZE},
    sync::SpinLock,
};

/// Bitmap words; 2048 words track 128 Ki frames (512 MiB of RAM).
const BITMAP_WORDS: usize = 2048;

/// Frames the bitmap can describe.
pub const MAX_MANAGED_FRAMES: usize = BITMAP_WORDS * 64;

/// Frames below this are legacy/BIOS territory and stay reserved.
const RESERVED_LOW_FRAMES: u64 = 0x100000 / PAGE_SIZE; // first 1 MiB

/// Frame allocation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAllocError {
    /// Every managed frame is in use.
    OutOfMemory,
    /// Address beyond the managed range or not frame-aligned.
    InvalidFrame,
}

/// The bitmap allocator state.
pub struct FrameBitmap {
    /// 1 = free, 0 = used.
    words: [u64; BITMAP_WORDS],
    /// Word index where the next scan starts.
    hint: usize,
    free_frames: usize,
    total_frames: usize,
    /// One past the highest frame handed to `insert_range`.
    limit: u64,
}

impl FrameBitmap {
    pub const fn new() -> Self {
        Self {
            words: [0; BITMAP_WORDS],
            hint: 0,
            free_frames: 0,
            total_frames: 0,
            limit: 0,
        }
    }

    /// Add a range of usable physical memory, clipped to the managed window.
    pub fn insert_range(&mut self, start: PhysicalAddress, end: PhysicalAddress) {
        let first = start.as_u64().div_ceil(PAGE_SIZE).max(RESERVED_LOW_FRAMES);
        let last = (end.as_u64() >> PAGE_SHIFT).min(MAX_MANAGED_FRAMES as u64);

        for frame in first..last {
            let (word, bit) = (frame as usize / 64, frame as usize % 64);
            if self.words[word] & (1 << bit) == 0 {
                self.words[word] |= 1 << bit;
                self.free_frames += 1;
                self.total_frames += 1;
            }
        }
        self.limit = self.limit.max(last);
    }

    /// Reserve a frame so it is never allocated (kernel image, boot tables).
    pub fn mark_used(&mut self, frame: PhysicalAddress) {
        let n = frame.frame_number() as usize;
        if n >= MAX_MANAGED_FRAMES {
            return;
        }
        let (word, bit) = (n / 64, n % 64);
        if self.words[word] & (1 << bit) != 0 {
            self.words[word] &= !(1 << bit);
            self.free_frames -= 1;
        }
    }

    /// First-fit allocation starting at the hint cursor.
    pub fn alloc(&mut self) -> Result<PhysicalAddress, FrameAllocError> {
        if self.free_frames == 0 {
            return Err(FrameAllocError::OutOfMemory);
        }

        let words = self.words.len();
        for i in 0..words {
            let word = (self.hint + i) % words;
            if self.words[word] == 0 {
                continue;
            }
            let bit = self.words[word].trailing_zeros() as usize;
            self.words[word] &= !(1 << bit);
            self.free_frames -= 1;
            self.hint = word;
            return Ok(PhysicalAddress::new(((word * 64 + bit) as u64) << PAGE_SHIFT));
        }

        // free_frames said otherwise; the bitmap is corrupt.
        panic!("pmm: free count {} but no clear bit found", self.free_frames);
    }

    /// Return a frame to the pool.
    pub fn free(&mut self, frame: PhysicalAddress) -> Result<(), FrameAllocError> {
        if !frame.is_page_aligned() {
            return Err(FrameAllocError::InvalidFrame);
        }
        let n = frame.frame_number();
        if n >= self.limit || n < RESERVED_LOW_FRAMES {
            return Err(FrameAllocError::InvalidFrame);
        }

        let (word, bit) = (n as usize / 64, n as usize % 64);
        if self.words[word] & (1 << bit) != 0 {
            panic!("pmm: double free of frame {:#x}", frame.as_u64());
        }
        self.words[word] |= 1 << bit;
        self.free_frames += 1;
        // Freed frames are likely re-used soon; pull the cursor back.
        self.hint = self.hint.min(word);
        Ok(())
    }

    pub fn free_count(&self) -> usize {
        self.free_frames
    }

    pub fn total_count(&self) -> usize {
        self.total_frames
    }

    /// One past the highest managed frame, in frames.
    pub fn frame_limit(&self) -> u64 {
        self.limit
    }
}

/// Global frame allocator. Lowest lock in the ordering; nothing may be
/// acquired while holding it.
static FRAME_ALLOCATOR: SpinLock<FrameBitmap> = SpinLock::new(FrameBitmap::new());

/// Allocate one 4 KiB frame.
pub fn alloc_frame() -> Result<PhysicalAddress, FrameAllocError> {
    FRAME_ALLOCATOR.lock().alloc()
}

/// Free one 4 KiB frame. Panics on double free.
pub fn free_frame(frame: PhysicalAddress) {
    if let Err(e) = FRAME_ALLOCATOR.lock().free(frame) {
        log::warn!("pmm: rejected free of {:#x}: {:?}", frame.as_u64(), e);
    }
}

pub fn free_frames() -> usize {
    FRAME_ALLOCATOR.lock().free_count()
}

pub fn total_frames() -> usize {
    FRAME_ALLOCATOR.lock().total_count()
}

/// A physical address is plausible if it falls under the managed ceiling.
pub fn is_managed(paddr: PhysicalAddress) -> bool {
    paddr.as_u64() != 0 && paddr.frame_number() < FRAME_ALLOCATOR.lock().frame_limit()
}

/// Build the pool from the bootloader's memory map and re-reserve the
/// kernel image.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn init(memory_regions: &bootloader_api::info::MemoryRegions) {
    use bootloader_api::info::MemoryRegionKind;

    // The bootloader's map lists the kernel image and boot structures as
    // non-usable kinds, so only genuinely free RAM enters the pool; the
    // sub-1 MiB clip in `insert_range` handles legacy regions.
    let mut bitmap = FRAME_ALLOCATOR.lock();
    for region in memory_regions.iter() {
        if region.kind == MemoryRegionKind::Usable {
            bitmap.insert_range(
                PhysicalAddress::new(region.start),
                PhysicalAddress::new(region.end),
            );
        }
    }

    log::info!(
        "pmm: {} frames usable ({} MiB)",
        bitmap.free_count(),
        bitmap.free_count() * PAGE_SIZE as usize / (1024 * 1024)
    );
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn small_pool() -> FrameBitmap {
        let mut bitmap = FrameBitmap::new();
        // 1 MiB..2 MiB usable: 256 frames.
        bitmap.insert_range(PhysicalAddress::new(0x100000), PhysicalAddress::new(0x200000));
        bitmap
    }

    #[test]
    fn low_memory_is_never_pooled() {
        let mut bitmap = FrameBitmap::new();
        bitmap.insert_range(PhysicalAddress::new(0), PhysicalAddress::new(0x200000));
        // Only the frames at and above 1 MiB count.
        assert_eq!(bitmap.free_count(), 256);
        let frame = bitmap.alloc().expect("pool with free frames must allocate");
        assert!(frame.as_u64() >= 0x100000);
    }

    #[test]
    fn alloc_free_roundtrip() {
        let mut bitmap = small_pool();
        let before = bitmap.free_count();
        let frame = bitmap.alloc().expect("fresh pool must allocate");
        assert_eq!(bitmap.free_count(), before - 1);
        bitmap.free(frame).expect("freeing an allocated frame succeeds");
        assert_eq!(bitmap.free_count(), before);
    }

    #[test]
    fn exhaustion_returns_oom_and_leaves_bitmap_intact() {
        let mut bitmap = small_pool();
        while bitmap.free_count() > 0 {
            bitmap.alloc().expect("count said a frame was free");
        }
        assert_eq!(bitmap.alloc(), Err(FrameAllocError::OutOfMemory));
        assert_eq!(bitmap.free_count(), 0);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal() {
        let mut bitmap = small_pool();
        let frame = bitmap.alloc().expect("fresh pool must allocate");
        bitmap.free(frame).expect("first free succeeds");
        let _ = bitmap.free(frame);
    }

    #[test]
    fn mark_used_excludes_frame() {
        let mut bitmap = small_pool();
        let frame = PhysicalAddress::new(0x100000);
        bitmap.mark_used(frame);
        let got = bitmap.alloc().expect("other frames remain");
        assert_ne!(got, frame);
    }

    #[test]
    fn hint_moves_forward_but_rewinds_on_free() {
        let mut bitmap = small_pool();
        let a = bitmap.alloc().expect("alloc a");
        let b = bitmap.alloc().expect("alloc b");
        assert_eq!(b.as_u64(), a.as_u64() + PAGE_SIZE);
        bitmap.free(a).expect("free a");
        let again = bitmap.alloc().expect("alloc after rewind");
        assert_eq!(again, a);
    }
}
