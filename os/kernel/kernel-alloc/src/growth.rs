//! Committing memory to the heap window.

use crate::{BitmapFrameAllocator, HeapError};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_vmem::{AddressSpace, FrameAlloc, Mmu, PageTableEntry, PhysMapper, Vmm};

/// Makes fresh pages of the heap window usable.
pub trait HeapGrowth {
    /// Back `pages` pages starting at `at` with writable memory.
    ///
    /// On error nothing in the range may be left committed.
    ///
    /// # Errors
    /// Whatever prevented the pages from being backed.
    fn grow(&mut self, at: VirtualAddress, pages: u64) -> Result<(), HeapError>;
}

/// Backs heap pages with frames from the PMM mapped into the kernel space.
pub struct PagedGrowth<'a, M: PhysMapper, U: Mmu> {
    pub pmm: &'a mut BitmapFrameAllocator,
    pub vmm: &'a Vmm<M, U>,
    pub space: &'a mut AddressSpace,
}

impl<M: PhysMapper, U: Mmu> PagedGrowth<'_, M, U> {
    /// Unmap the first `pages` pages at `at` and return their frames.
    fn roll_back(&mut self, at: VirtualAddress, pages: u64) {
        for n in 0..pages {
            let Some(va) = at.nth_page(n) else { break };
            if let Ok(pa) = self.vmm.unmap_page(self.space, va) {
                self.pmm.free(pa);
            }
        }
    }
}

impl<M: PhysMapper, U: Mmu> HeapGrowth for PagedGrowth<'_, M, U> {
    fn grow(&mut self, at: VirtualAddress, pages: u64) -> Result<(), HeapError> {
        for n in 0..pages {
            let va = at + n * PAGE_SIZE;
            let Some(pa) = self.pmm.alloc_frame() else {
                log::warn!("heap growth ran out of frames after {n} of {pages} pages");
                self.roll_back(at, n);
                return Err(HeapError::OutOfFrames);
            };

            if let Err(e) = self
                .vmm
                .map_page(self.pmm, self.space, va, pa, PageTableEntry::kernel_rw())
            {
                log::warn!("heap growth failed to map {va}: {e}");
                self.pmm.free(pa);
                self.roll_back(at, n);
                return Err(e.into());
            }
        }
        Ok(())
    }
}
