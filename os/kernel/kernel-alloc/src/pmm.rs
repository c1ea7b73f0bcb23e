//! # Physical Frame Allocator
//!
//! One bit per 4 KiB frame of physical memory, `1` meaning allocated or
//! reserved. The bitmap itself lives in the first usable region large enough
//! to hold it and is reached through the HHDM.
//!
//! ```text
//! word 0                         word 1
//! ┌──────────────────────────────┬──────────────────────────────┬──
//! │ bit 0 = frame 0 … bit 63     │ bit 0 = frame 64 …           │
//! └──────────────────────────────┴──────────────────────────────┴──
//! ```
//!
//! Frames outside every usable region stay set forever. `used_pages` counts
//! the set bits inside usable ranges, including the bitmap's own frames.

use kernel_info::boot::MemoryRegion;
use kernel_memory_addresses::{FrameNumber, PAGE_SIZE, PhysicalAddress, align_down, align_up, pages_for};
use kernel_vmem::{FrameAlloc, PhysMapper};

const BITS: u64 = u64::BITS as u64;

/// Bitmap physical frame allocator.
pub struct BitmapFrameAllocator {
    bitmap: &'static mut [u64],
    total_pages: u64,
    used_pages: u64,
}

impl BitmapFrameAllocator {
    /// An allocator that owns no memory; every allocation fails.
    #[must_use]
    pub fn unusable() -> Self {
        Self {
            bitmap: &mut [],
            total_pages: 0,
            used_pages: 0,
        }
    }

    /// Build the bitmap from the boot memory map.
    ///
    /// `total_pages` is derived from the highest usable address. If no usable
    /// region can hold the bitmap, the result is [`unusable`](Self::unusable)
    /// and the failure is logged; the caller decides whether that is fatal.
    ///
    /// # Safety
    /// - Every usable region must be RAM reachable through `mapper`.
    /// - Nothing else may use usable memory after this call except through
    ///   frames handed out by the returned allocator.
    #[allow(clippy::cast_possible_truncation)]
    pub unsafe fn init<I, M>(regions: I, mapper: &M) -> Self
    where
        I: IntoIterator<Item = MemoryRegion>,
        I::IntoIter: Clone,
        M: PhysMapper,
    {
        let regions = regions.into_iter();
        let usable = || regions.clone().filter(MemoryRegion::is_usable);

        let highest = usable().map(|r| r.end()).max().unwrap_or(0);
        let total_pages = highest / PAGE_SIZE;
        let words = total_pages.div_ceil(BITS);
        let bitmap_bytes = words * 8;

        let placement = usable().find_map(|r| {
            let start = align_up(r.base.as_u64(), PAGE_SIZE)?;
            (total_pages > 0 && start.checked_add(bitmap_bytes)? <= r.end()).then_some(start)
        });
        let Some(start) = placement else {
            log::error!("no usable region can hold a {bitmap_bytes} byte frame bitmap");
            return Self::unusable();
        };

        let ptr = mapper.ptr_mut::<u64>(PhysicalAddress::new(start));
        let bitmap = unsafe { core::slice::from_raw_parts_mut(ptr, words as usize) };
        bitmap.fill(u64::MAX);

        let mut pmm = Self {
            bitmap,
            total_pages,
            used_pages: 0,
        };

        for r in usable() {
            let Some(first) = align_up(r.base.as_u64(), PAGE_SIZE) else {
                continue;
            };
            let first = first / PAGE_SIZE;
            let end = (align_down(r.end(), PAGE_SIZE) / PAGE_SIZE).min(total_pages);
            for frame in first..end {
                pmm.clear(frame);
            }
        }

        let own = FrameNumber::containing(PhysicalAddress::new(start)).as_u64();
        for frame in own..own + pages_for(bitmap_bytes) {
            if !pmm.is_set(frame) {
                pmm.set(frame);
                pmm.used_pages += 1;
            }
        }

        log::info!(
            "PMM initialized: {total_pages} pages, {} MiB free, bitmap at {start:#x}",
            pmm.free_memory() / 1024 / 1024
        );
        pmm
    }

    /// Whether the allocator owns any memory at all.
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        !self.bitmap.is_empty()
    }

    #[must_use]
    pub const fn total_pages(&self) -> u64 {
        self.total_pages
    }

    #[must_use]
    pub const fn used_pages(&self) -> u64 {
        self.used_pages
    }

    /// Bytes covered by the bitmap.
    #[must_use]
    pub const fn total_memory(&self) -> u64 {
        self.total_pages * PAGE_SIZE
    }

    /// Bytes not currently allocated or reserved.
    #[must_use]
    pub const fn free_memory(&self) -> u64 {
        (self.total_pages - self.used_pages) * PAGE_SIZE
    }

    /// The lowest free frame.
    pub fn alloc(&mut self) -> Option<PhysicalAddress> {
        let (w, word) = self
            .bitmap
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)?;
        let frame = w as u64 * BITS + u64::from(word.trailing_ones());
        if frame >= self.total_pages {
            return None;
        }
        self.set(frame);
        self.used_pages += 1;
        Some(FrameNumber::new(frame).base())
    }

    /// The lowest run of `count` free frames, all marked at once.
    pub fn alloc_contiguous(&mut self, count: u64) -> Option<PhysicalAddress> {
        if count == 0 {
            return None;
        }

        let mut run_start = 0;
        let mut run_len = 0;
        for frame in 0..self.total_pages {
            if self.is_set(frame) {
                run_start = frame + 1;
                run_len = 0;
                continue;
            }
            run_len += 1;
            if run_len == count {
                for f in run_start..run_start + count {
                    self.set(f);
                }
                self.used_pages += count;
                return Some(FrameNumber::new(run_start).base());
            }
        }
        None
    }

    /// Release one frame. Out-of-range or already free frames are ignored.
    pub fn free(&mut self, pa: PhysicalAddress) {
        let frame = pa.frame().as_u64();
        if frame < self.total_pages && self.is_set(frame) {
            self.clear(frame);
            self.used_pages -= 1;
        }
    }

    /// Release `count` frames starting at `pa`, with the same rules as [`free`](Self::free).
    pub fn free_contiguous(&mut self, pa: PhysicalAddress, count: u64) {
        let first = pa.frame().as_u64();
        for frame in first..first.saturating_add(count) {
            self.free(FrameNumber::new(frame).base());
        }
    }

    /// Allocate three frames and return them; logs the verdict.
    pub fn self_test(&mut self) -> bool {
        let before = self.used_pages;
        let frames = [self.alloc(), self.alloc(), self.alloc()];
        let passed = frames.iter().all(Option::is_some);
        for pa in frames.into_iter().flatten() {
            self.free(pa);
        }

        if passed && self.used_pages == before {
            log::info!("PMM self-test: PASSED");
            true
        } else {
            log::error!("PMM self-test: FAILED");
            false
        }
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn is_set(&self, frame: u64) -> bool {
        self.bitmap[(frame / BITS) as usize] & (1 << (frame % BITS)) != 0
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn set(&mut self, frame: u64) {
        self.bitmap[(frame / BITS) as usize] |= 1 << (frame % BITS);
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn clear(&mut self, frame: u64) {
        self.bitmap[(frame / BITS) as usize] &= !(1 << (frame % BITS));
    }
}

impl FrameAlloc for BitmapFrameAllocator {
    #[inline]
    fn alloc_frame(&mut self) -> Option<PhysicalAddress> {
        self.alloc()
    }

    #[inline]
    fn free_frame(&mut self, pa: PhysicalAddress) {
        self.free(pa);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_vmem::testing::FakePhysicalMemory;

    const MIB: u64 = 1024 * 1024;

    /// 4 MiB of fake RAM: frames 0..16 reserved, the rest usable.
    fn pmm_over(mem: &FakePhysicalMemory, regions: &[MemoryRegion]) -> BitmapFrameAllocator {
        unsafe { BitmapFrameAllocator::init(regions.iter().copied(), &mem.hhdm()) }
    }

    fn frame(n: u64) -> PhysicalAddress {
        PhysicalAddress::new(n * PAGE_SIZE)
    }

    #[test]
    fn bitmap_is_placed_in_first_fitting_region_and_reserved() {
        let mem = FakePhysicalMemory::new(1024);
        let pmm = pmm_over(
            &mem,
            &[MemoryRegion::reserved(0, 16 * PAGE_SIZE), MemoryRegion::usable(16 * PAGE_SIZE, 4 * MIB - 16 * PAGE_SIZE)],
        );

        assert!(pmm.is_usable());
        assert_eq!(pmm.total_pages(), 1024);
        assert_eq!(pmm.total_memory(), 4 * MIB);
        // 1024 bits fit into a single frame.
        assert_eq!(pmm.used_pages(), 1);
        assert!(pmm.is_set(16));
        assert_eq!(pmm.free_memory(), (1024 - 1) * PAGE_SIZE);
    }

    #[test]
    fn alloc_is_first_fit_and_skips_reserved_frames() {
        let mem = FakePhysicalMemory::new(256);
        let mut pmm = pmm_over(
            &mem,
            &[MemoryRegion::reserved(0, 4 * PAGE_SIZE), MemoryRegion::usable(4 * PAGE_SIZE, 252 * PAGE_SIZE)],
        );

        // Frame 4 holds the bitmap.
        assert_eq!(pmm.alloc(), Some(frame(5)));
        assert_eq!(pmm.alloc(), Some(frame(6)));
        pmm.free(frame(5));
        assert_eq!(pmm.alloc(), Some(frame(5)));
    }

    #[test]
    fn alloc_and_free_keep_used_pages_in_step() {
        let mem = FakePhysicalMemory::new(256);
        let mut pmm = pmm_over(&mem, &[MemoryRegion::usable(0, 256 * PAGE_SIZE)]);
        let used = pmm.used_pages();

        let a = pmm.alloc().unwrap();
        let b = pmm.alloc().unwrap();
        assert_ne!(a, b);
        assert_eq!(pmm.used_pages(), used + 2);
        pmm.free(a);
        pmm.free(b);
        assert_eq!(pmm.used_pages(), used);
    }

    #[test]
    fn double_free_and_out_of_range_free_are_ignored() {
        let mem = FakePhysicalMemory::new(64);
        let mut pmm = pmm_over(&mem, &[MemoryRegion::usable(0, 64 * PAGE_SIZE)]);
        let a = pmm.alloc().unwrap();
        pmm.free(a);
        let used = pmm.used_pages();

        pmm.free(a);
        pmm.free(frame(10_000));
        pmm.free_contiguous(frame(60), 100);
        assert_eq!(pmm.used_pages(), used);
    }

    #[test]
    fn contiguous_allocation_never_commits_a_partial_run() {
        let mem = FakePhysicalMemory::new(64);
        // Bitmap in frame 0; frames 1..4 usable, 4..8 reserved, 8..11 usable.
        let mut pmm = pmm_over(
            &mem,
            &[
                MemoryRegion::usable(0, 4 * PAGE_SIZE),
                MemoryRegion::reserved(4 * PAGE_SIZE, 4 * PAGE_SIZE),
                MemoryRegion::usable(8 * PAGE_SIZE, 3 * PAGE_SIZE),
            ],
        );
        let used = pmm.used_pages();

        assert_eq!(pmm.alloc_contiguous(4), None);
        assert_eq!(pmm.used_pages(), used);

        assert_eq!(pmm.alloc_contiguous(3), Some(frame(1)));
        assert_eq!(pmm.alloc_contiguous(3), Some(frame(8)));
        assert_eq!(pmm.used_pages(), used + 6);

        pmm.free_contiguous(frame(8), 3);
        assert_eq!(pmm.used_pages(), used + 3);
        assert_eq!(pmm.alloc_contiguous(0), None);
    }

    #[test]
    fn exactly_three_free_frames_refuse_a_run_of_four() {
        let mem = FakePhysicalMemory::new(16);
        let mut pmm = pmm_over(&mem, &[MemoryRegion::usable(0, 4 * PAGE_SIZE)]);
        assert_eq!(pmm.free_memory(), 3 * PAGE_SIZE);

        assert_eq!(pmm.alloc_contiguous(4), None);
        assert_eq!(pmm.free_memory(), 3 * PAGE_SIZE);
        assert!(pmm.alloc_contiguous(3).is_some());
        assert_eq!(pmm.alloc(), None);
    }

    #[test]
    fn no_room_for_the_bitmap_yields_an_unusable_allocator() {
        let mem = FakePhysicalMemory::new(4);
        // 8 GiB of address space needs a 256 KiB bitmap; the only usable
        // region at the bottom is a single frame.
        let mut pmm = pmm_over(
            &mem,
            &[MemoryRegion::usable(0, PAGE_SIZE), MemoryRegion::usable(8 * 1024 * MIB - PAGE_SIZE, PAGE_SIZE)],
        );
        assert!(!pmm.is_usable());
        assert_eq!(pmm.alloc(), None);
        assert_eq!(pmm.alloc_contiguous(1), None);
        assert_eq!(pmm.total_memory(), 0);
    }

    #[test]
    fn self_test_leaves_counters_untouched() {
        let mem = FakePhysicalMemory::new(64);
        let mut pmm = pmm_over(&mem, &[MemoryRegion::usable(0, 64 * PAGE_SIZE)]);
        let used = pmm.used_pages();
        assert!(pmm.self_test());
        assert_eq!(pmm.used_pages(), used);

        let tiny = FakePhysicalMemory::new(4);
        let mut pmm = pmm_over(&tiny, &[MemoryRegion::usable(0, 2 * PAGE_SIZE)]);
        assert!(!pmm.self_test());
        assert_eq!(pmm.used_pages(), 1);
    }

    #[test]
    fn unaligned_region_edges_are_trimmed() {
        let mem = FakePhysicalMemory::new(16);
        let mut pmm = pmm_over(&mem, &[MemoryRegion::usable(0x800, 4 * PAGE_SIZE)]);
        // Frames 1..4 are whole; frame 1 holds the bitmap.
        assert_eq!(pmm.total_pages(), 4);
        assert_eq!(pmm.alloc(), Some(frame(2)));
        assert_eq!(pmm.alloc(), Some(frame(3)));
        assert_eq!(pmm.alloc(), None);
    }
}
