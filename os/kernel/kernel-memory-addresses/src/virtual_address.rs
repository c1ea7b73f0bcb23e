use crate::{PAGE_OFFSET_MASK, PAGE_SIZE, align_down};
use core::fmt;
use core::ops::Add;

/// Virtual memory address.
///
/// Canonicality is not enforced; the value is only tagged as virtual.
///
/// A 48-bit virtual address decomposes into four 9-bit table indices and a
/// 12-bit page offset:
///
/// ```text
/// 63      48 47     39 38     30 29     21 20     12 11          0
/// ┌─────────┬─────────┬─────────┬─────────┬─────────┬────────────┐
/// │  sign   │  PML4   │  PDPT   │   PD    │   PT    │   offset   │
/// └─────────┴─────────┴─────────┴─────────┴─────────┴────────────┘
/// ```
///
/// ```rust
/// # use kernel_memory_addresses::VirtualAddress;
/// let va = VirtualAddress::new(0xFFFF_8000_0020_3123);
/// assert_eq!(va.table_indices(), [256, 0, 1, 3]);
/// assert_eq!(va.page_offset(), 0x123);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_OFFSET_MASK
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    #[inline]
    #[must_use]
    pub const fn page_base(self) -> Self {
        Self(align_down(self.0, PAGE_SIZE))
    }

    /// Table indices from the root down: `[pml4, pdpt, pd, pt]`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn table_indices(self) -> [usize; 4] {
        [
            ((self.0 >> 39) & 0x1FF) as usize,
            ((self.0 >> 30) & 0x1FF) as usize,
            ((self.0 >> 21) & 0x1FF) as usize,
            ((self.0 >> 12) & 0x1FF) as usize,
        ]
    }

    /// Address of the `n`-th page after this one's page base.
    #[inline]
    #[must_use]
    pub const fn nth_page(self, n: u64) -> Option<Self> {
        match n.checked_mul(PAGE_SIZE) {
            Some(delta) => self.page_base().checked_add(delta),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualAddress(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}
