use crate::PageTable;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};

/// Bytes in one frame, as an array length.
#[allow(clippy::cast_possible_truncation)]
pub const FRAME_BYTES: usize = PAGE_SIZE as usize;

/// Converts physical addresses into addresses the kernel can dereference.
///
/// The kernel maps all physical memory at a fixed offset (the HHDM), so the
/// translation is pure arithmetic. This trait is the only place where a
/// physical address becomes a pointer.
pub trait PhysMapper {
    /// The HHDM alias of `pa`.
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress;

    /// Inverse of [`phys_to_virt`](Self::phys_to_virt); `None` below the window.
    fn virt_to_phys(&self, va: VirtualAddress) -> Option<PhysicalAddress>;

    /// Borrow the page table stored in frame `pa`.
    ///
    /// # Safety
    /// - `pa` must be a frame holding a page table, reachable through the HHDM.
    /// - No other live reference may alias the same frame for `'a`.
    #[inline]
    unsafe fn table_mut<'a>(&self, pa: PhysicalAddress) -> &'a mut PageTable {
        let p = self.ptr_mut::<PageTable>(pa.page_base());
        unsafe { &mut *p }
    }

    /// Borrow the bytes of frame `pa`.
    ///
    /// # Safety
    /// Same as [`table_mut`](Self::table_mut), for an arbitrary data frame.
    #[inline]
    unsafe fn frame_mut<'a>(&self, pa: PhysicalAddress) -> &'a mut [u8; FRAME_BYTES] {
        let p = self.ptr_mut::<[u8; FRAME_BYTES]>(pa.page_base());
        unsafe { &mut *p }
    }

    /// Raw pointer to the HHDM alias of `pa`.
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn ptr_mut<T>(&self, pa: PhysicalAddress) -> *mut T {
        core::ptr::with_exposed_provenance_mut(self.phys_to_virt(pa).as_u64() as usize)
    }
}

/// Higher-half direct map: `va = pa + offset`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Hhdm {
    offset: u64,
}

impl Hhdm {
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }
}

impl PhysMapper for Hhdm {
    #[inline]
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(pa.as_u64().wrapping_add(self.offset))
    }

    #[inline]
    fn virt_to_phys(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        va.as_u64().checked_sub(self.offset).map(PhysicalAddress::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::memory::HHDM_BASE;

    #[test]
    fn hhdm_round_trip() {
        let m = Hhdm::new(HHDM_BASE);
        let pa = PhysicalAddress::new(0x1234_5678);
        let va = m.phys_to_virt(pa);
        assert_eq!(va.as_u64(), HHDM_BASE + 0x1234_5678);
        assert_eq!(m.virt_to_phys(va), Some(pa));
        assert_eq!(m.virt_to_phys(VirtualAddress::new(0x1000)), None);
    }
}
