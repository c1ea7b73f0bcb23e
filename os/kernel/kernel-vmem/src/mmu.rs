use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// The translation hardware the VMM has to keep in sync with the tables.
pub trait Mmu {
    /// Drop the cached translation of one page (`invlpg`).
    fn invalidate_page(&self, va: VirtualAddress);

    /// Drop every non-global cached translation (CR3 reload).
    fn flush_all(&self);

    /// Physical address of the active root table.
    fn current_root(&self) -> PhysicalAddress;

    /// Switch to the hierarchy rooted at `root`.
    ///
    /// # Safety
    /// `root` must be a valid PML4 that maps the running code, its stack and
    /// every structure the caller touches afterwards.
    unsafe fn load_root(&self, root: PhysicalAddress);
}

/// The x86-64 MMU of the executing CPU.
///
/// Requires CPL0; compiled to no-ops off bare-metal x86-64.
#[derive(Debug, Default, Copy, Clone)]
pub struct X86Mmu;

impl Mmu for X86Mmu {
    #[inline]
    fn invalidate_page(&self, va: VirtualAddress) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        let _ = va;
    }

    #[inline]
    fn flush_all(&self) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        unsafe {
            core::arch::asm!(
                "mov {tmp}, cr3",
                "mov cr3, {tmp}",
                tmp = out(reg) _,
                options(nostack, preserves_flags)
            );
        }
    }

    #[inline]
    fn current_root(&self) -> PhysicalAddress {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        {
            let cr3: u64;
            unsafe {
                core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
            }
            PhysicalAddress::new(cr3 & crate::PageTableEntry::ADDRESS_MASK)
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        PhysicalAddress::zero()
    }

    #[inline]
    unsafe fn load_root(&self, root: PhysicalAddress) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) root.as_u64(), options(nostack, preserves_flags));
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        let _ = root;
    }
}
