use crate::{AddressSpace, FrameAlloc, MapError, Mmu, PageTableEntry, PhysMapper};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_sync::IrqGuard;

const SIZE_1G: u64 = 1 << 30;
const SIZE_2M: u64 = 1 << 21;

/// Table level below the root, counted from the leaf: PT = 1, PD = 2, PDPT = 3.
type Level = u8;

/// The virtual memory manager.
///
/// Stateless apart from its two collaborators; every operation names the
/// [`AddressSpace`] it works on, and every frame it needs comes from the
/// [`FrameAlloc`] passed in. Table edits run with interrupts masked.
pub struct Vmm<M: PhysMapper, U: Mmu> {
    mapper: M,
    mmu: U,
}

impl<M: PhysMapper, U: Mmu> Vmm<M, U> {
    pub const fn new(mapper: M, mmu: U) -> Self {
        Self { mapper, mmu }
    }

    #[inline]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[inline]
    pub const fn mmu(&self) -> &U {
        &self.mmu
    }

    #[inline]
    pub fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        self.mapper.phys_to_virt(pa)
    }

    #[inline]
    pub fn virt_to_phys(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.mapper.virt_to_phys(va)
    }

    /// Adopt the hierarchy the CPU is running on as the kernel space.
    ///
    /// # Safety
    /// Call once, at boot, while CR3 holds the kernel's own root table.
    pub unsafe fn kernel_space_from_current(&self) -> AddressSpace {
        let root = self.mmu.current_root();
        log::debug!("kernel root table at {root}");
        unsafe { AddressSpace::kernel(root) }
    }

    /// A fresh space: empty lower half, upper half shared with `kernel`.
    ///
    /// # Errors
    /// [`MapError::OutOfFrames`] if no frame is left for the root table.
    pub fn create_address_space<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        kernel: &AddressSpace,
    ) -> Result<AddressSpace, MapError> {
        let _irq = IrqGuard::new();
        let root = alloc.alloc_frame().ok_or(MapError::OutOfFrames)?;

        // SAFETY: `root` was just handed out and is not yet reachable from
        // anywhere else; the kernel root is a live table in another frame.
        let table = unsafe { self.mapper.table_mut(root) };
        let kernel_table = unsafe { self.mapper.table_mut(kernel.root()) };
        table.zero();
        table.share_upper_half(kernel_table);

        log::trace!("created address space rooted at {root}");
        Ok(AddressSpace::derived(root))
    }

    /// Free every frame the space owns and then its root.
    ///
    /// Only the lower half is walked: intermediate tables and present 4 KiB
    /// leaf frames are returned to `alloc`, shared kernel tables are never
    /// touched. Returns the number of frames freed. The kernel space is
    /// refused and nothing is freed.
    pub fn destroy_address_space<A: FrameAlloc>(&self, alloc: &mut A, space: AddressSpace) -> usize {
        if space.is_kernel() {
            log::error!("refusing to destroy the kernel address space");
            return 0;
        }

        let _irq = IrqGuard::new();
        let root = space.root();
        let root_table = unsafe { self.mapper.table_mut(root) };

        let mut freed = 0;
        for (_, e) in root_table.lower_half().filter(|(_, e)| e.present()) {
            freed += self.free_table(alloc, e.address(), 3);
        }
        root_table.zero();
        alloc.free_frame(root);

        log::trace!("destroyed address space {root}, {} frames freed", freed + 1);
        freed + 1
    }

    fn free_table<A: FrameAlloc>(&self, alloc: &mut A, table_pa: PhysicalAddress, level: Level) -> usize {
        let table = unsafe { self.mapper.table_mut(table_pa) };
        let mut freed = 0;
        for (i, e) in table.present() {
            if level == 1 {
                alloc.free_frame(e.address());
                freed += 1;
            } else if e.huge() {
                log::warn!("leaving huge page at {} (level {level}, index {i})", e.address());
            } else {
                freed += self.free_table(alloc, e.address(), level - 1);
            }
        }
        alloc.free_frame(table_pa);
        freed + 1
    }

    /// Map the 4 KiB page at `va` to the frame at `pa`.
    ///
    /// Missing intermediate tables are allocated, zeroed and linked with
    /// [`PageTableEntry::table_link`]. The leaf becomes `pa | flags | present`
    /// and replaces whatever was there; the TLB entry for `va` is invalidated.
    ///
    /// # Errors
    /// - [`MapError::Unaligned`] if `va` or `pa` is not page aligned.
    /// - [`MapError::HugePage`] if a huge page already covers `va`.
    /// - [`MapError::OutOfFrames`] if an intermediate table cannot be
    ///   allocated. Tables created before the failure stay linked (empty).
    pub fn map_page<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        space: &mut AddressSpace,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageTableEntry,
    ) -> Result<(), MapError> {
        if !va.is_page_aligned() || !pa.is_page_aligned() {
            return Err(MapError::Unaligned);
        }

        let _irq = IrqGuard::new();
        let [i4, i3, i2, i1] = va.table_indices();
        let pdpt = self.next_table_or_create(alloc, space.root(), i4)?;
        let pd = self.next_table_or_create(alloc, pdpt, i3)?;
        let pt = self.next_table_or_create(alloc, pd, i2)?;

        let table = unsafe { self.mapper.table_mut(pt) };
        table.set(i1, PageTableEntry::leaf(pa, flags));
        self.mmu.invalidate_page(va);
        Ok(())
    }

    fn next_table_or_create<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        table_pa: PhysicalAddress,
        index: usize,
    ) -> Result<PhysicalAddress, MapError> {
        let table = unsafe { self.mapper.table_mut(table_pa) };
        let e = table.get(index);
        if e.present() {
            return if e.huge() {
                Err(MapError::HugePage)
            } else {
                Ok(e.address())
            };
        }

        let frame = alloc.alloc_frame().ok_or(MapError::OutOfFrames)?;
        unsafe { self.mapper.table_mut(frame) }.zero();
        table.set(index, PageTableEntry::leaf(frame, PageTableEntry::table_link()));
        Ok(frame)
    }

    fn next_table(&self, table_pa: PhysicalAddress, index: usize) -> Result<PhysicalAddress, MapError> {
        let e = unsafe { self.mapper.table_mut(table_pa) }.get(index);
        match (e.present(), e.huge()) {
            (false, _) => Err(MapError::NotMapped),
            (true, true) => Err(MapError::HugePage),
            (true, false) => Ok(e.address()),
        }
    }

    /// Remove the 4 KiB mapping at `va` and return the frame it pointed at.
    ///
    /// The frame itself is not freed.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if any level of the walk is absent,
    /// [`MapError::HugePage`] if a huge page covers `va`.
    pub fn unmap_page(&self, space: &mut AddressSpace, va: VirtualAddress) -> Result<PhysicalAddress, MapError> {
        let _irq = IrqGuard::new();
        let [i4, i3, i2, i1] = va.table_indices();
        let pdpt = self.next_table(space.root(), i4)?;
        let pd = self.next_table(pdpt, i3)?;
        let pt = self.next_table(pd, i2)?;

        let table = unsafe { self.mapper.table_mut(pt) };
        let leaf = table.get(i1);
        if !leaf.present() {
            return Err(MapError::NotMapped);
        }
        table.clear(i1);
        self.mmu.invalidate_page(va.page_base());
        Ok(leaf.address())
    }

    /// Resolve `va` in `space` without modifying anything.
    ///
    /// The page offset of `va` is carried over. 1 GiB and 2 MiB pages are
    /// resolved as well.
    pub fn translate(&self, space: &AddressSpace, va: VirtualAddress) -> Option<PhysicalAddress> {
        let [i4, i3, i2, i1] = va.table_indices();
        let v = va.as_u64();

        let pdpt = self.next_table(space.root(), i4).ok()?;

        let e3 = unsafe { self.mapper.table_mut(pdpt) }.get(i3);
        if !e3.present() {
            return None;
        }
        if e3.huge() {
            let base = e3.address().as_u64() & !(SIZE_1G - 1);
            return Some(PhysicalAddress::new(base | (v & (SIZE_1G - 1))));
        }

        let e2 = unsafe { self.mapper.table_mut(e3.address()) }.get(i2);
        if !e2.present() {
            return None;
        }
        if e2.huge() {
            let base = e2.address().as_u64() & !(SIZE_2M - 1);
            return Some(PhysicalAddress::new(base | (v & (SIZE_2M - 1))));
        }

        let e1 = unsafe { self.mapper.table_mut(e2.address()) }.get(i1);
        if !e1.present() {
            return None;
        }
        Some(PhysicalAddress::new(e1.address().as_u64() | va.page_offset()))
    }

    /// Map `pages` consecutive pages starting at `va` to consecutive frames
    /// starting at `pa`.
    ///
    /// All or nothing: the range must be unmapped to begin with, and if any
    /// page fails, every page mapped by this call is unmapped again before
    /// the error is returned. Tables created on the way stay linked (empty).
    ///
    /// # Errors
    /// Whatever [`map_page`](Self::map_page) reports,
    /// [`MapError::AlreadyMapped`] if any page of the range already
    /// translates (huge pages included) and [`MapError::Overflow`] if either
    /// range wraps.
    pub fn map_range<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        space: &mut AddressSpace,
        va: VirtualAddress,
        pa: PhysicalAddress,
        pages: u64,
        flags: PageTableEntry,
    ) -> Result<(), MapError> {
        if !va.is_page_aligned() || !pa.is_page_aligned() {
            return Err(MapError::Unaligned);
        }
        let len = pages.checked_mul(PAGE_SIZE).ok_or(MapError::Overflow)?;
        va.checked_add(len).ok_or(MapError::Overflow)?;
        pa.checked_add(len).ok_or(MapError::Overflow)?;

        if let Some(page) = (0..pages)
            .filter_map(|n| va.nth_page(n))
            .find(|&page| self.translate(space, page).is_some())
        {
            log::debug!("map_range refused: {page} is already mapped");
            return Err(MapError::AlreadyMapped);
        }

        for n in 0..pages {
            let offset = n * PAGE_SIZE;
            let result = self.map_page(alloc, space, va + offset, pa + offset, flags);
            if let Err(e) = result {
                log::debug!("map_range failed at page {n} of {pages} ({e}), rolling back");
                self.unmap_range(space, va, n);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Unmap `pages` consecutive pages starting at `va`; returns how many
    /// were actually mapped. Holes are skipped.
    pub fn unmap_range(&self, space: &mut AddressSpace, va: VirtualAddress, pages: u64) -> usize {
        (0..pages)
            .filter_map(|n| va.nth_page(n))
            .filter(|&page| self.unmap_page(space, page).is_ok())
            .count()
    }

    /// Make `space` the active hierarchy (CR3 load).
    ///
    /// # Safety
    /// The caller's code, stack and data must stay mapped in `space`. For a
    /// derived space that holds for everything in the shared upper half.
    pub unsafe fn activate(&self, space: &AddressSpace) {
        unsafe { self.mmu.load_root(space.root()) };
    }

    /// Drop every cached translation.
    pub fn flush_tlb(&self) {
        self.mmu.flush_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Hhdm;
    use crate::testing::{BumpFrames, FakePhysicalMemory, RecordingMmu};
    use kernel_info::memory::HEAP_BASE;

    const USER_VA: u64 = 0x40_0000;

    struct Fixture {
        _mem: FakePhysicalMemory,
        vmm: Vmm<Hhdm, RecordingMmu>,
        kernel: AddressSpace,
        frames: BumpFrames,
    }

    /// Frame 1 is the kernel root, frames 2.. feed the allocator. The kernel
    /// gets one upper-half mapping so there is something to share.
    fn fixture(frames: u64) -> Fixture {
        let mem = FakePhysicalMemory::new(80);
        let vmm = Vmm::new(mem.hhdm(), RecordingMmu::default());
        let mut kernel = unsafe { AddressSpace::kernel(PhysicalAddress::new(PAGE_SIZE)) };
        let mut boot = BumpFrames::new(70, 10);
        vmm.map_page(
            &mut boot,
            &mut kernel,
            VirtualAddress::new(HEAP_BASE),
            PhysicalAddress::new(79 * PAGE_SIZE),
            PageTableEntry::kernel_rw(),
        )
        .expect("kernel mapping");
        Fixture {
            _mem: mem,
            vmm,
            kernel,
            frames: BumpFrames::new(2, frames),
        }
    }

    fn frame(n: u64) -> PhysicalAddress {
        PhysicalAddress::new(n * PAGE_SIZE)
    }

    #[test]
    fn translate_keeps_page_offset() {
        let mut f = fixture(16);
        let mut space = f.vmm.create_address_space(&mut f.frames, &f.kernel).unwrap();
        let va = VirtualAddress::new(USER_VA);

        f.vmm
            .map_page(&mut f.frames, &mut space, va, frame(40), PageTableEntry::user_rw())
            .unwrap();

        assert_eq!(
            f.vmm.translate(&space, VirtualAddress::new(USER_VA + 0x123)),
            Some(PhysicalAddress::new(40 * PAGE_SIZE + 0x123))
        );
        assert_eq!(f.vmm.mmu().invalidated(), [va]);
    }

    #[test]
    fn map_page_creates_three_intermediate_tables() {
        let mut f = fixture(16);
        let mut space = f.vmm.create_address_space(&mut f.frames, &f.kernel).unwrap();
        let before = f.frames.allocated();

        f.vmm
            .map_page(&mut f.frames, &mut space, VirtualAddress::new(USER_VA), frame(40), PageTableEntry::user_rw())
            .unwrap();
        assert_eq!(f.frames.allocated() - before, 3);

        // Same PT, nothing new.
        f.vmm
            .map_page(
                &mut f.frames,
                &mut space,
                VirtualAddress::new(USER_VA + PAGE_SIZE),
                frame(41),
                PageTableEntry::user_rw(),
            )
            .unwrap();
        assert_eq!(f.frames.allocated() - before, 3);
    }

    #[test]
    fn map_page_overwrites_existing_leaf() {
        let mut f = fixture(16);
        let mut space = f.vmm.create_address_space(&mut f.frames, &f.kernel).unwrap();
        let va = VirtualAddress::new(USER_VA);
        f.vmm.map_page(&mut f.frames, &mut space, va, frame(40), PageTableEntry::user_rw()).unwrap();
        f.vmm.map_page(&mut f.frames, &mut space, va, frame(41), PageTableEntry::user_rx()).unwrap();
        assert_eq!(f.vmm.translate(&space, va), Some(frame(41)));
    }

    #[test]
    fn unaligned_addresses_are_rejected() {
        let mut f = fixture(16);
        let mut space = f.vmm.create_address_space(&mut f.frames, &f.kernel).unwrap();
        let err = f
            .vmm
            .map_page(&mut f.frames, &mut space, VirtualAddress::new(USER_VA + 8), frame(40), PageTableEntry::user_rw());
        assert_eq!(err, Err(MapError::Unaligned));
        let err = f.vmm.map_page(
            &mut f.frames,
            &mut space,
            VirtualAddress::new(USER_VA),
            PhysicalAddress::new(40 * PAGE_SIZE + 1),
            PageTableEntry::user_rw(),
        );
        assert_eq!(err, Err(MapError::Unaligned));
    }

    #[test]
    fn map_page_reports_frame_exhaustion() {
        // Root plus two tables; the PT cannot be allocated.
        let mut f = fixture(3);
        let mut space = f.vmm.create_address_space(&mut f.frames, &f.kernel).unwrap();
        let err = f
            .vmm
            .map_page(&mut f.frames, &mut space, VirtualAddress::new(USER_VA), frame(40), PageTableEntry::user_rw());
        assert_eq!(err, Err(MapError::OutOfFrames));
        assert_eq!(f.vmm.translate(&space, VirtualAddress::new(USER_VA)), None);
    }

    #[test]
    fn unmap_clears_leaf_and_invalidates() {
        let mut f = fixture(16);
        let mut space = f.vmm.create_address_space(&mut f.frames, &f.kernel).unwrap();
        let va = VirtualAddress::new(USER_VA);
        f.vmm.map_page(&mut f.frames, &mut space, va, frame(40), PageTableEntry::user_rw()).unwrap();

        assert_eq!(f.vmm.unmap_page(&mut space, va), Ok(frame(40)));
        assert_eq!(f.vmm.translate(&space, va), None);
        assert_eq!(f.vmm.unmap_page(&mut space, va), Err(MapError::NotMapped));
        assert_eq!(f.vmm.mmu().invalidated(), [va, va]);
    }

    #[test]
    fn unmap_of_never_mapped_region_fails() {
        let mut f = fixture(16);
        let mut space = f.vmm.create_address_space(&mut f.frames, &f.kernel).unwrap();
        assert_eq!(
            f.vmm.unmap_page(&mut space, VirtualAddress::new(0x7000_0000)),
            Err(MapError::NotMapped)
        );
    }

    #[test]
    fn derived_space_shares_upper_half_only() {
        let mut f = fixture(16);
        let space = f.vmm.create_address_space(&mut f.frames, &f.kernel).unwrap();
        assert!(!space.is_kernel());

        let heap = VirtualAddress::new(HEAP_BASE);
        assert_eq!(f.vmm.translate(&space, heap), Some(frame(79)));
        assert_eq!(f.vmm.translate(&space, VirtualAddress::new(USER_VA)), None);

        let root = unsafe { f.vmm.mapper().table_mut(space.root()) };
        assert_eq!(root.lower_half().filter(|(_, e)| e.present()).count(), 0);
    }

    #[test]
    fn lower_half_mappings_do_not_leak_into_kernel() {
        let mut f = fixture(16);
        let mut space = f.vmm.create_address_space(&mut f.frames, &f.kernel).unwrap();
        let va = VirtualAddress::new(USER_VA);
        f.vmm.map_page(&mut f.frames, &mut space, va, frame(40), PageTableEntry::user_rw()).unwrap();
        assert_eq!(f.vmm.translate(&f.kernel, va), None);
    }

    #[test]
    fn destroy_frees_exactly_the_owned_frames() {
        let mut f = fixture(16);
        let mut space = f.vmm.create_address_space(&mut f.frames, &f.kernel).unwrap();
        let root = space.root();

        for n in 0..2 {
            let leaf = f.frames.alloc_frame().unwrap();
            f.vmm
                .map_page(
                    &mut f.frames,
                    &mut space,
                    VirtualAddress::new(USER_VA + n * PAGE_SIZE),
                    leaf,
                    PageTableEntry::user_rw(),
                )
                .unwrap();
        }
        let allocated = f.frames.allocated();

        // root + PDPT + PD + PT + two leaves
        assert_eq!(f.vmm.destroy_address_space(&mut f.frames, space), 6);
        assert_eq!(f.frames.freed().len(), allocated);
        assert!(f.frames.freed().contains(&root));

        // The shared kernel mapping survives.
        assert_eq!(f.vmm.translate(&f.kernel, VirtualAddress::new(HEAP_BASE)), Some(frame(79)));
    }

    #[test]
    fn destroying_the_kernel_space_is_refused() {
        let mut f = fixture(16);
        let kernel = unsafe { AddressSpace::kernel(f.kernel.root()) };
        assert_eq!(f.vmm.destroy_address_space(&mut f.frames, kernel), 0);
        assert!(f.frames.freed().is_empty());
    }

    #[test]
    fn map_range_rolls_back_on_failure() {
        // Root plus PDPT, PD, PT for the first page; the second page needs
        // another PT that cannot be allocated.
        let mut f = fixture(4);
        let mut space = f.vmm.create_address_space(&mut f.frames, &f.kernel).unwrap();
        let start = VirtualAddress::new(SIZE_2M - PAGE_SIZE);

        let err = f
            .vmm
            .map_range(&mut f.frames, &mut space, start, frame(40), 2, PageTableEntry::user_rw());
        assert_eq!(err, Err(MapError::OutOfFrames));
        assert_eq!(f.vmm.translate(&space, start), None);
    }

    #[test]
    fn map_range_leaves_existing_mappings_alone() {
        // Enough frames for the walk of the first page only.
        let mut f = fixture(4);
        let mut space = f.vmm.create_address_space(&mut f.frames, &f.kernel).unwrap();
        let start = VirtualAddress::new(SIZE_2M - PAGE_SIZE);
        f.vmm
            .map_page(&mut f.frames, &mut space, start, frame(50), PageTableEntry::user_rw())
            .unwrap();
        let allocated = f.frames.allocated();

        let err = f
            .vmm
            .map_range(&mut f.frames, &mut space, start, frame(40), 2, PageTableEntry::user_rw());
        assert_eq!(err, Err(MapError::AlreadyMapped));
        assert_eq!(f.vmm.translate(&space, start), Some(frame(50)));
        assert_eq!(f.frames.allocated(), allocated);

        // Overlap at the end of the range is caught too.
        let below = VirtualAddress::new(SIZE_2M - 2 * PAGE_SIZE);
        let err = f
            .vmm
            .map_range(&mut f.frames, &mut space, below, frame(40), 2, PageTableEntry::user_rw());
        assert_eq!(err, Err(MapError::AlreadyMapped));
        assert_eq!(f.vmm.translate(&space, below), None);
        assert_eq!(f.vmm.translate(&space, start), Some(frame(50)));
    }

    #[test]
    fn map_range_maps_consecutive_frames() {
        let mut f = fixture(16);
        let mut space = f.vmm.create_address_space(&mut f.frames, &f.kernel).unwrap();
        let va = VirtualAddress::new(USER_VA);
        f.vmm
            .map_range(&mut f.frames, &mut space, va, frame(40), 3, PageTableEntry::user_rx())
            .unwrap();
        for n in 0..3 {
            assert_eq!(
                f.vmm.translate(&space, VirtualAddress::new(USER_VA + n * PAGE_SIZE)),
                Some(frame(40 + n))
            );
        }
        assert_eq!(f.vmm.unmap_range(&mut space, va, 4), 3);
        assert_eq!(f.vmm.translate(&space, va), None);
    }

    #[test]
    fn huge_pages_translate_but_block_4k_mapping() {
        let mut f = fixture(16);
        let mut space = f.vmm.create_address_space(&mut f.frames, &f.kernel).unwrap();
        let va = VirtualAddress::new(USER_VA);
        f.vmm
            .map_page(&mut f.frames, &mut space, va, frame(40), PageTableEntry::user_rw())
            .unwrap();

        // Turn the PD entry covering `va` into a 2 MiB page at 0x20_0000.
        let [i4, i3, i2, _] = va.table_indices();
        let pdpt = f.vmm.next_table(space.root(), i4).unwrap();
        let pd = f.vmm.next_table(pdpt, i3).unwrap();
        let huge = PageTableEntry::leaf(PhysicalAddress::new(SIZE_2M), PageTableEntry::user_rw().with_huge(true));
        unsafe { f.vmm.mapper().table_mut(pd) }.set(i2, huge);

        assert_eq!(
            f.vmm.translate(&space, VirtualAddress::new(USER_VA + 0x1234)),
            Some(PhysicalAddress::new(SIZE_2M + 0x1234))
        );
        let err = f
            .vmm
            .map_page(&mut f.frames, &mut space, va, frame(41), PageTableEntry::user_rw());
        assert_eq!(err, Err(MapError::HugePage));
    }

    #[test]
    fn activate_and_flush_reach_the_mmu() {
        let mut f = fixture(16);
        let space = f.vmm.create_address_space(&mut f.frames, &f.kernel).unwrap();
        unsafe { f.vmm.activate(&space) };
        f.vmm.flush_tlb();
        assert_eq!(f.vmm.mmu().root(), space.root());
        assert_eq!(f.vmm.mmu().flushes(), 1);

        let adopted = unsafe { f.vmm.kernel_space_from_current() };
        assert!(adopted.is_kernel());
        assert_eq!(adopted.root(), space.root());
    }
}
