//! The boot volume image the loader left in memory.

use kernel_info::boot::RamdiskInfo;
use kernel_syscall::fat12::SECTOR_SIZE;
use kernel_syscall::{DeviceError, SectorDevice};

/// Read-only sectors over an in-memory disk image.
pub struct Ramdisk<'a> {
    bytes: &'a [u8],
}

impl<'a> Ramdisk<'a> {
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// Borrow the image described by `info` through the direct map.
    ///
    /// Returns `None` if the loader passed no image.
    ///
    /// # Safety
    /// `info` must describe physical memory that stays untouched for `'a`
    /// and is reachable at `hhdm_offset + base`.
    #[allow(clippy::cast_possible_truncation)]
    pub unsafe fn from_info(info: &RamdiskInfo, hhdm_offset: u64) -> Option<Self> {
        if info.base == 0 || info.len == 0 {
            return None;
        }
        let start = core::ptr::with_exposed_provenance::<u8>((hhdm_offset + info.base) as usize);
        let bytes = unsafe { core::slice::from_raw_parts(start, info.len as usize) };
        Some(Self::new(bytes))
    }

    pub const fn sectors(&self) -> usize {
        self.bytes.len() / SECTOR_SIZE
    }
}

impl SectorDevice for Ramdisk<'_> {
    fn read_sector(&mut self, lba: u32, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), DeviceError> {
        let at = usize::try_from(lba).map_err(|_| DeviceError)? * SECTOR_SIZE;
        let sector = self.bytes.get(at..at + SECTOR_SIZE).ok_or(DeviceError)?;
        buf.copy_from_slice(sector);
        Ok(())
    }
}
