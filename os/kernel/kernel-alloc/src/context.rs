//! # Kernel Memory Context
//!
//! Owns the frame allocator, the VMM, the kernel address space and the heap,
//! and brings them up in dependency order: VMM (needs only the HHDM), PMM
//! (reaches its bitmap through the HHDM), heap (frames from the PMM mapped by
//! the VMM).
//!
//! The kernel keeps one instance in a [`SyncOnceCell`]; every mutation goes
//! through [`SpinMutex::lock_irq`], so interrupts stay masked while the
//! bitmap, a page table or the heap list is being edited.

use crate::growth::PagedGrowth;
use crate::heap::{Heap, HeapStats};
use crate::pmm::BitmapFrameAllocator;
use crate::{BootError, HeapError};
use core::ptr::NonNull;
use kernel_info::boot::MemoryRegion;
use kernel_info::memory::MemoryLayout;
use kernel_memory_addresses::PhysicalAddress;
use kernel_sync::{SpinMutex, SyncOnceCell};
use kernel_vmem::{AddressSpace, Hhdm, Mmu, PhysMapper, Vmm, X86Mmu};

/// Init-once home of a memory context.
pub type KernelMemoryCell<M = Hhdm, U = X86Mmu> = SyncOnceCell<SpinMutex<KernelMemory<M, U>>>;

static KERNEL_MEMORY: KernelMemoryCell = SyncOnceCell::new();

/// Bring up kernel memory management exactly once.
///
/// Subsequent calls return the already initialized context.
///
/// # Safety
/// See [`KernelMemory::init`]; additionally CR3 must hold the kernel's
/// root table and `layout.hhdm_offset` must be the live direct map.
///
/// # Errors
/// Any [`BootError`]; the kernel cannot continue without memory management.
pub unsafe fn init_kernel_memory<I>(
    regions: I,
    layout: &MemoryLayout,
) -> Result<&'static SpinMutex<KernelMemory>, BootError>
where
    I: IntoIterator<Item = MemoryRegion>,
    I::IntoIter: Clone,
{
    KERNEL_MEMORY.get_or_try_init(|| {
        let mapper = Hhdm::new(layout.hhdm_offset);
        unsafe { KernelMemory::init(regions, layout, mapper, X86Mmu) }.map(SpinMutex::new)
    })
}

/// The kernel memory context, once [`init_kernel_memory`] succeeded.
pub fn kernel_memory() -> Option<&'static SpinMutex<KernelMemory>> {
    KERNEL_MEMORY.get()
}

/// Physical frames, page tables and the heap of the running kernel.
pub struct KernelMemory<M: PhysMapper = Hhdm, U: Mmu = X86Mmu> {
    pmm: BitmapFrameAllocator,
    vmm: Vmm<M, U>,
    kernel_space: AddressSpace,
    heap: Heap,
}

impl<M: PhysMapper, U: Mmu> KernelMemory<M, U> {
    /// Adopt the active root table, build the frame bitmap, run the PMM self
    /// test and commit the initial heap.
    ///
    /// # Safety
    /// - `regions` must describe physical memory truthfully and every usable
    ///   region must be reachable through `mapper`.
    /// - `mmu` must report the kernel's own root table as current.
    /// - The heap window in `layout` must be unused virtual address space.
    ///
    /// # Errors
    /// - [`BootError::NoKernelRoot`] if no root table is active.
    /// - [`BootError::NoBitmapRegion`] if the PMM found no place for its bitmap.
    /// - [`BootError::Heap`] if the initial heap pages cannot be committed.
    pub unsafe fn init<I>(regions: I, layout: &MemoryLayout, mapper: M, mmu: U) -> Result<Self, BootError>
    where
        I: IntoIterator<Item = MemoryRegion>,
        I::IntoIter: Clone,
    {
        let vmm = Vmm::new(mapper, mmu);
        let mut kernel_space = unsafe { vmm.kernel_space_from_current() };
        if kernel_space.root() == PhysicalAddress::zero() {
            return Err(BootError::NoKernelRoot);
        }

        let mut pmm = unsafe { BitmapFrameAllocator::init(regions, vmm.mapper()) };
        if !pmm.is_usable() {
            return Err(BootError::NoBitmapRegion);
        }
        pmm.self_test();

        let heap = Heap::init(
            layout,
            &mut PagedGrowth {
                pmm: &mut pmm,
                vmm: &vmm,
                space: &mut kernel_space,
            },
        )?;

        Ok(Self {
            pmm,
            vmm,
            kernel_space,
            heap,
        })
    }

    /// Allocate `size` bytes from the kernel heap, growing it if needed.
    ///
    /// # Errors
    /// See [`Heap::alloc`].
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        let (heap, mut growth) = self.heap_and_growth();
        heap.alloc(size, &mut growth)
    }

    /// # Errors
    /// See [`Heap::free`].
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        self.heap.free(ptr)
    }

    /// # Errors
    /// See [`Heap::calloc`].
    pub fn calloc(&mut self, count: usize, size: usize) -> Result<NonNull<u8>, HeapError> {
        let (heap, mut growth) = self.heap_and_growth();
        heap.calloc(count, size, &mut growth)
    }

    /// # Errors
    /// See [`Heap::realloc`].
    pub fn realloc(&mut self, ptr: Option<NonNull<u8>>, new_size: usize) -> Result<Option<NonNull<u8>>, HeapError> {
        let (heap, mut growth) = self.heap_and_growth();
        heap.realloc(ptr, new_size, &mut growth)
    }

    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    pub const fn pmm(&self) -> &BitmapFrameAllocator {
        &self.pmm
    }

    pub const fn vmm(&self) -> &Vmm<M, U> {
        &self.vmm
    }

    pub const fn kernel_space(&self) -> &AddressSpace {
        &self.kernel_space
    }

    /// Everything needed to build and tear down another address space.
    pub const fn parts(&mut self) -> (&mut BitmapFrameAllocator, &Vmm<M, U>, &AddressSpace) {
        (&mut self.pmm, &self.vmm, &self.kernel_space)
    }

    fn heap_and_growth(&mut self) -> (&mut Heap, PagedGrowth<'_, M, U>) {
        let Self {
            pmm,
            vmm,
            kernel_space,
            heap,
        } = self;
        (
            heap,
            PagedGrowth {
                pmm,
                vmm,
                space: kernel_space,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
    use kernel_vmem::testing::{FakePhysicalMemory, RecordingMmu};

    const KERNEL_ROOT: u64 = PAGE_SIZE;

    struct Machine {
        ram: FakePhysicalMemory,
        window: FakePhysicalMemory,
    }

    impl Machine {
        fn new(ram_frames: usize, window_pages: usize) -> Self {
            Self {
                ram: FakePhysicalMemory::new(ram_frames),
                window: FakePhysicalMemory::new(window_pages),
            }
        }

        fn layout(&self, initial: u64, growth: u64) -> MemoryLayout {
            MemoryLayout {
                hhdm_offset: self.ram.hhdm().offset(),
                heap_base: self.window.hhdm().offset(),
                heap_max_size: self.window.len(),
                heap_initial_pages: initial,
                heap_growth_pages: growth,
            }
        }

        /// Frames 0 and 1 (the kernel root) are reserved, the rest is RAM.
        fn regions(&self) -> [MemoryRegion; 2] {
            let frames = self.ram.frames() as u64;
            [
                MemoryRegion::reserved(0, 2 * PAGE_SIZE),
                MemoryRegion::usable(2 * PAGE_SIZE, (frames - 2) * PAGE_SIZE),
            ]
        }

        fn boot(&self, initial: u64, growth: u64) -> Result<KernelMemory<Hhdm, RecordingMmu>, BootError> {
            self.boot_with(&self.regions(), initial, growth)
        }

        fn boot_with(
            &self,
            regions: &[MemoryRegion],
            initial: u64,
            growth: u64,
        ) -> Result<KernelMemory<Hhdm, RecordingMmu>, BootError> {
            let mmu = RecordingMmu::with_root(PhysicalAddress::new(KERNEL_ROOT));
            unsafe {
                KernelMemory::init(
                    regions.iter().copied(),
                    &self.layout(initial, growth),
                    self.ram.hhdm(),
                    mmu,
                )
            }
        }

        fn heap_page(&self, n: u64) -> VirtualAddress {
            VirtualAddress::new(self.window.hhdm().offset() + n * PAGE_SIZE)
        }
    }

    fn mapped_pages(km: &KernelMemory<Hhdm, RecordingMmu>, m: &Machine, upto: u64) -> u64 {
        (0..upto)
            .filter(|&n| km.vmm().translate(km.kernel_space(), m.heap_page(n)).is_some())
            .count() as u64
    }

    #[test]
    fn boot_commits_and_maps_the_initial_heap() {
        let m = Machine::new(256, 64);
        let km = m.boot(4, 4).unwrap();

        assert!(km.pmm().is_usable());
        assert_eq!(mapped_pages(&km, &m, 64), 4);
        assert_eq!(km.heap_stats().total, 4 * PAGE_SIZE as usize);
        // Bitmap, at least three tables, four heap pages.
        assert!(km.pmm().used_pages() >= 8);
    }

    #[test]
    fn heap_growth_maps_fresh_frames() {
        let m = Machine::new(256, 64);
        let mut km = m.boot(2, 4).unwrap();
        let used = km.pmm().used_pages();

        let p = km.alloc(3 * PAGE_SIZE as usize).unwrap();
        assert_eq!(km.heap_stats().total, 6 * PAGE_SIZE as usize);
        assert_eq!(mapped_pages(&km, &m, 64), 6);
        assert!(km.pmm().used_pages() >= used + 4);

        km.free(p).unwrap();
        assert_eq!(km.heap_stats().used, 0);
    }

    #[test]
    fn failed_growth_returns_its_frames() {
        // Bitmap in frame 2; frames 3..16 are all there is.
        let m = Machine::new(16, 64);
        let mut km = m.boot(2, 1).unwrap();
        let free_before = km.pmm().free_memory();

        assert_eq!(km.alloc(32 * PAGE_SIZE as usize), Err(HeapError::OutOfFrames));
        assert_eq!(mapped_pages(&km, &m, 64), 2);
        assert_eq!(km.heap_stats().total, 2 * PAGE_SIZE as usize);
        // Only intermediate tables created on the way may stay behind.
        assert!(free_before - km.pmm().free_memory() <= 2 * PAGE_SIZE);
    }

    #[test]
    fn calloc_and_realloc_go_through_the_heap() {
        let m = Machine::new(256, 64);
        let mut km = m.boot(2, 2).unwrap();

        let z = km.calloc(8, 8).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(z.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0));

        let r = km.realloc(Some(z), 16).unwrap();
        assert_eq!(r, Some(z));
        assert_eq!(km.realloc(Some(z), 0), Ok(None));
        assert_eq!(km.free(z), Err(HeapError::NotAllocated));
        assert_eq!(km.heap_stats().used, 0);
        assert_eq!(km.alloc(0), Err(HeapError::ZeroSize));
    }

    #[test]
    fn no_room_for_the_bitmap_is_fatal() {
        let m = Machine::new(8, 8);
        let regions = [MemoryRegion::reserved(0, 8 * PAGE_SIZE)];
        assert!(matches!(m.boot_with(&regions, 1, 1), Err(BootError::NoBitmapRegion)));
    }

    #[test]
    fn too_little_ram_for_the_initial_heap_is_fatal() {
        let m = Machine::new(6, 8);
        // Bitmap in frame 2, frames 3..6 free: not enough for tables plus 4 pages.
        assert!(matches!(m.boot(4, 1), Err(BootError::Heap(HeapError::OutOfFrames))));
    }

    #[test]
    fn missing_root_table_is_fatal() {
        let m = Machine::new(16, 8);
        let mmu = RecordingMmu::default();
        let res = unsafe { KernelMemory::init(m.regions(), &m.layout(1, 1), m.ram.hhdm(), mmu) };
        assert!(matches!(res, Err(BootError::NoKernelRoot)));
    }
}
