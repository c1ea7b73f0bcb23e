use crate::{PAGE_SHIFT, PhysicalAddress};
use core::fmt;

/// Physical page number: the index of a 4 KiB frame in physical memory.
///
/// This is what the frame bitmap is indexed by. The physical address of a
/// frame is only ever produced through [`FrameNumber::base`].
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FrameNumber(u64);

impl FrameNumber {
    #[inline]
    #[must_use]
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    /// The frame that contains `pa`.
    #[inline]
    #[must_use]
    pub const fn containing(pa: PhysicalAddress) -> Self {
        Self(pa.as_u64() >> PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Index into per-frame tables.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// First byte of the frame.
    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, n: u64) -> Option<Self> {
        match self.0.checked_add(n) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameNumber({:#x})", self.0)
    }
}

impl From<FrameNumber> for PhysicalAddress {
    #[inline]
    fn from(frame: FrameNumber) -> Self {
        frame.base()
    }
}
