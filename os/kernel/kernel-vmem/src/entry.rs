use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// A single 64-bit x86-64 paging-structure entry, valid at every level.
///
/// ### Bit layout
///
/// | Bits   | Name | Meaning |
/// |--------|------|---------|
/// | 0      | P    | present |
/// | 1      | RW   | writable |
/// | 2      | US   | user-mode accessible |
/// | 3      | PWT  | write-through caching |
/// | 4      | PCD  | cache disabled |
/// | 5      | A    | accessed (set by the CPU) |
/// | 6      | D    | dirty (set by the CPU, leaf only) |
/// | 7      | PS   | huge page (PDPTE 1 GiB / PDE 2 MiB) |
/// | 8      | G    | global (leaf only) |
/// | 9–11   | -    | OS available |
/// | 12–51  | addr | physical frame bits \[51:12\] |
/// | 52–62  | -    | OS available / protection key |
/// | 63     | NX   | no-execute |
///
/// The entry is only meaningful while `present` is set. The low twelve bits
/// are flags; the address never spills into them.
///
/// ```rust
/// # use kernel_memory_addresses::PhysicalAddress;
/// # use kernel_vmem::PageTableEntry;
/// let e = PageTableEntry::leaf(PhysicalAddress::new(0x5000), PageTableEntry::user_rw());
/// assert!(e.present() && e.writable() && e.user());
/// assert_eq!(e.address().as_u64(), 0x5000);
/// assert_eq!(e.into_bits(), 0x5000 | 0b111);
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1). Clear for read-only.
    pub writable: bool,

    /// User/Supervisor (US, bit 2). Set to allow CPL3 access.
    pub user: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5).
    pub accessed: bool,

    /// Dirty (D, bit 6). Leaf only.
    pub dirty: bool,

    /// Page Size (PS, bit 7). In a PDPTE or PDE the entry maps a 1 GiB or
    /// 2 MiB page instead of pointing at the next table.
    pub huge: bool,

    /// Global (G, bit 8). Survives CR3 reloads when CR4.PGE is set.
    pub global: bool,

    /// OS-available (bits 9..=11).
    #[bits(3)]
    pub os_available_low: u8,

    /// Physical address bits \[51:12\].
    #[bits(40)]
    frame_bits: u64,

    /// OS-available and protection key bits (52..=62).
    #[bits(11)]
    pub os_available_high: u16,

    /// No-Execute (NX, bit 63). Requires `EFER.NXE`.
    pub no_execute: bool,
}

impl PageTableEntry {
    /// Mask selecting the physical address bits of a raw entry.
    pub const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    /// The not-present entry.
    pub const EMPTY: Self = Self::new();

    /// The physical address this entry points at.
    #[inline]
    #[must_use]
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame_bits() << 12)
    }

    /// Replace the address bits; the low 12 bits of `pa` are discarded.
    #[inline]
    #[must_use]
    pub const fn with_address(self, pa: PhysicalAddress) -> Self {
        self.with_frame_bits((pa.as_u64() & Self::ADDRESS_MASK) >> 12)
    }

    /// This entry with the address bits cleared.
    #[inline]
    #[must_use]
    pub const fn flags(self) -> Self {
        self.with_frame_bits(0)
    }

    /// A present entry mapping `pa` with the given `flags`.
    #[inline]
    #[must_use]
    pub const fn leaf(pa: PhysicalAddress, flags: Self) -> Self {
        flags.with_address(pa).with_present(true)
    }

    /// Flags used to link intermediate tables.
    ///
    /// Present, writable and user-accessible so a walk is never blocked above
    /// the leaf; the leaf decides the effective permissions.
    #[inline]
    #[must_use]
    pub const fn table_link() -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(true)
    }

    /// Supervisor read/write data.
    #[inline]
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self::new().with_present(true).with_writable(true)
    }

    /// User read/write.
    #[inline]
    #[must_use]
    pub const fn user_rw() -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(true)
    }

    /// User read/execute.
    #[inline]
    #[must_use]
    pub const fn user_rx() -> Self {
        Self::new().with_present(true).with_user(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_bits_match_hardware_positions() {
        let bit = |e: PageTableEntry| e.into_bits();
        assert_eq!(bit(PageTableEntry::new().with_present(true)), 1 << 0);
        assert_eq!(bit(PageTableEntry::new().with_writable(true)), 1 << 1);
        assert_eq!(bit(PageTableEntry::new().with_user(true)), 1 << 2);
        assert_eq!(bit(PageTableEntry::new().with_write_through(true)), 1 << 3);
        assert_eq!(bit(PageTableEntry::new().with_cache_disabled(true)), 1 << 4);
        assert_eq!(bit(PageTableEntry::new().with_accessed(true)), 1 << 5);
        assert_eq!(bit(PageTableEntry::new().with_dirty(true)), 1 << 6);
        assert_eq!(bit(PageTableEntry::new().with_huge(true)), 1 << 7);
        assert_eq!(bit(PageTableEntry::new().with_global(true)), 1 << 8);
        assert_eq!(bit(PageTableEntry::new().with_no_execute(true)), 1 << 63);
    }

    #[test]
    fn address_never_touches_flag_bits() {
        let e = PageTableEntry::kernel_rw().with_address(PhysicalAddress::new(0x1234_5FFF));
        assert_eq!(e.address(), PhysicalAddress::new(0x1234_5000));
        assert_eq!(e.into_bits() & 0xFFF, 0b11);
        assert_eq!(e.into_bits() & !PageTableEntry::ADDRESS_MASK & !(1 << 63), 0b11);
    }

    #[test]
    fn flags_strips_address() {
        let e = PageTableEntry::leaf(PhysicalAddress::new(0x7000), PageTableEntry::user_rx());
        assert_eq!(e.flags(), PageTableEntry::user_rx());
        assert_eq!(PageTableEntry::EMPTY.into_bits(), 0);
    }
}
