//! # Kernel Memory Addresses
//!
//! Strongly typed physical and virtual addresses plus the frame number type
//! used by the physical frame allocator.
//!
//! The kernel only maps 4 KiB pages, so the page geometry is a set of plain
//! constants rather than a type-level page size.
//!
//! ```text
//!  PhysicalAddress ──frame()──► FrameNumber ──base()──► PhysicalAddress
//!         │                                                 ▲
//!         └──────── HHDM (+offset) ───► VirtualAddress ─────┘ (−offset)
//! ```
//!
//! Neither type carries a pointer. Turning an address into something that can
//! be dereferenced is the job of the HHDM mapper in `kernel-vmem`, which is the
//! only place that performs that conversion.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod frame_number;
mod physical_address;
mod virtual_address;

pub use frame_number::FrameNumber;
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// Size of a page and of a physical frame, in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = 12;

/// Mask selecting the in-page offset bits of an address.
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

const _: () = assert!(1 << PAGE_SHIFT == PAGE_SIZE);

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0, 4096), 0);
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(8191, 4096), 4096);
/// assert_eq!(align_down(0x12345, 16), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`, or `None` on overflow.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0, 4096), Some(0));
/// assert_eq!(align_up(1, 4096), Some(4096));
/// assert_eq!(align_up(4097, 4096), Some(8192));
/// assert_eq!(align_up(u64::MAX, 4096), None);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> Option<u64> {
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}

/// Number of pages needed to hold `bytes` bytes.
///
/// ```rust
/// # use kernel_memory_addresses::pages_for;
/// assert_eq!(pages_for(0), 0);
/// assert_eq!(pages_for(1), 1);
/// assert_eq!(pages_for(4096), 1);
/// assert_eq!(pages_for(4100), 2);
/// ```
#[inline(always)]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}
