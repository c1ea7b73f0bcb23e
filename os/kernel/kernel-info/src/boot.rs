//! # Kernel Boot Information

use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};

/// Kernel function pointer.
///
/// # ABI
/// The ABI is defined as `win64` since the kernel is called from a UEFI
/// (PE/COFF) application.
pub type KernelEntryFn = extern "win64" fn(*const KernelBootInfo) -> !;

/// Information the kernel needs right after `ExitBootServices`.
/// Keep this `#[repr(C)]` and prefer fixed-size integers at the ABI boundary.
#[repr(C)]
#[derive(Clone)]
pub struct KernelBootInfo {
    /// Memory map information.
    pub mmap: MemoryMapInfo,

    /// Ramdisk holding the FAT12 volume, or zeroes if none was loaded.
    pub ramdisk: RamdiskInfo,
}

#[repr(C)]
#[derive(Clone)]
pub struct MemoryMapInfo {
    /// Pointer to the raw UEFI memory map buffer (array of `EFI_MEMORY_DESCRIPTOR` bytes).
    pub mmap_ptr: u64,

    /// Length of the memory map buffer in **bytes**.
    pub mmap_len: u64,

    /// Size of a single memory descriptor in bytes (`EFI_MEMORY_DESCRIPTOR_VERSION` dependent).
    pub mmap_desc_size: u64,

    /// Descriptor version (from UEFI). Kernel can check it matches expectations.
    pub mmap_desc_version: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RamdiskInfo {
    /// Physical address of the first byte of the image.
    pub base: u64,
    /// Length of the image in bytes.
    pub len: u64,
}

/// What a span of physical memory may be used for.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryRegionKind {
    /// Free RAM, owned by the frame allocator after boot.
    Usable,
    /// Kernel image and loader data; never handed out.
    KernelAndModules,
    /// ACPI tables that may be reclaimed once parsed.
    AcpiReclaimable,
    /// Firmware or device memory.
    Reserved,
    /// Memory reported as faulty.
    Bad,
}

/// One entry of the boot memory map.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryRegion {
    pub base: PhysicalAddress,
    pub length: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn usable(base: u64, length: u64) -> Self {
        Self {
            base: PhysicalAddress::new(base),
            length,
            kind: MemoryRegionKind::Usable,
        }
    }

    #[must_use]
    pub const fn reserved(base: u64, length: u64) -> Self {
        Self {
            base: PhysicalAddress::new(base),
            length,
            kind: MemoryRegionKind::Reserved,
        }
    }

    /// First byte past the region.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.as_u64().saturating_add(self.length)
    }

    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, MemoryRegionKind::Usable)
    }
}

/// UEFI memory types (`EFI_MEMORY_TYPE`) the kernel distinguishes.
mod efi {
    pub const LOADER_CODE: u32 = 1;
    pub const LOADER_DATA: u32 = 2;
    pub const BOOT_SERVICES_CODE: u32 = 3;
    pub const BOOT_SERVICES_DATA: u32 = 4;
    pub const CONVENTIONAL: u32 = 7;
    pub const UNUSABLE: u32 = 8;
    pub const ACPI_RECLAIM: u32 = 9;

    /// Bytes of `EFI_MEMORY_DESCRIPTOR` the kernel reads.
    pub const DESCRIPTOR_MIN_SIZE: usize = 32;
}

impl MemoryRegionKind {
    /// Classify a UEFI memory type as seen after `ExitBootServices`.
    #[must_use]
    pub const fn from_efi(ty: u32) -> Self {
        match ty {
            efi::CONVENTIONAL | efi::BOOT_SERVICES_CODE | efi::BOOT_SERVICES_DATA => Self::Usable,
            efi::LOADER_CODE | efi::LOADER_DATA => Self::KernelAndModules,
            efi::ACPI_RECLAIM => Self::AcpiReclaimable,
            efi::UNUSABLE => Self::Bad,
            _ => Self::Reserved,
        }
    }
}

/// Decodes raw `EFI_MEMORY_DESCRIPTOR` records into [`MemoryRegion`]s.
///
/// Records shorter than the fields the kernel reads end the iteration.
#[derive(Debug, Clone)]
pub struct EfiMemoryMap<'a> {
    bytes: &'a [u8],
    stride: usize,
}

impl<'a> EfiMemoryMap<'a> {
    /// Wrap a raw memory map buffer with descriptors of `stride` bytes.
    #[must_use]
    pub const fn new(bytes: &'a [u8], stride: usize) -> Self {
        Self { bytes, stride }
    }

    /// Borrow the buffer described by `info`.
    ///
    /// # Safety
    /// `info.mmap_ptr .. + info.mmap_len` must be readable for `'a`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub unsafe fn from_info(info: &MemoryMapInfo) -> Self {
        let bytes = unsafe {
            core::slice::from_raw_parts(info.mmap_ptr as *const u8, info.mmap_len as usize)
        };
        Self::new(bytes, info.mmap_desc_size as usize)
    }
}

impl Iterator for EfiMemoryMap<'_> {
    type Item = MemoryRegion;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stride < efi::DESCRIPTOR_MIN_SIZE || self.bytes.len() < self.stride {
            return None;
        }
        let (d, rest) = self.bytes.split_at(self.stride);
        self.bytes = rest;

        let ty = u32::from_le_bytes([d[0], d[1], d[2], d[3]]);
        let phys_start = le64(&d[8..16]);
        let pages = le64(&d[24..32]);
        Some(MemoryRegion {
            base: PhysicalAddress::new(phys_start),
            length: pages.saturating_mul(PAGE_SIZE),
            kind: MemoryRegionKind::from_efi(ty),
        })
    }
}

#[inline]
fn le64(x: &[u8]) -> u64 {
    u64::from_le_bytes([x[0], x[1], x[2], x[3], x[4], x[5], x[6], x[7]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(ty: u32, start: u64, pages: u64, stride: usize) -> Vec<u8> {
        let mut d = vec![0u8; stride];
        d[0..4].copy_from_slice(&ty.to_le_bytes());
        d[8..16].copy_from_slice(&start.to_le_bytes());
        d[16..24].copy_from_slice(&0xdead_beef_u64.to_le_bytes());
        d[24..32].copy_from_slice(&pages.to_le_bytes());
        d
    }

    #[test]
    fn decodes_descriptors_with_padding_stride() {
        let mut raw = descriptor(7, 0x10_0000, 16, 48);
        raw.extend(descriptor(2, 0x20_0000, 4, 48));
        raw.extend(descriptor(11, 0xFEC0_0000, 1, 48));

        let regions: Vec<_> = EfiMemoryMap::new(&raw, 48).collect();
        assert_eq!(regions.len(), 3);
        assert_eq!(regions[0], MemoryRegion::usable(0x10_0000, 16 * 4096));
        assert_eq!(regions[1].kind, MemoryRegionKind::KernelAndModules);
        assert_eq!(regions[2].kind, MemoryRegionKind::Reserved);
        assert_eq!(regions[2].end(), 0xFEC0_1000);
    }

    #[test]
    fn trailing_partial_descriptor_is_ignored() {
        let mut raw = descriptor(7, 0, 1, 40);
        raw.extend_from_slice(&[0u8; 12]);
        assert_eq!(EfiMemoryMap::new(&raw, 40).count(), 1);
    }

    #[test]
    fn boot_services_memory_is_usable() {
        assert!(MemoryRegion {
            base: PhysicalAddress::zero(),
            length: 4096,
            kind: MemoryRegionKind::from_efi(4),
        }
        .is_usable());
    }
}
