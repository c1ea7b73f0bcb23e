//! # Memory Layout

use kernel_memory_addresses::PAGE_SIZE;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything mapped at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Start of the reserved kernel heap window.
pub const HEAP_BASE: u64 = 0xffff_c000_0000_0000;

/// Size of the kernel heap window; the heap never grows past it.
pub const HEAP_MAX_SIZE: u64 = 256 * 1024 * 1024;

/// Pages mapped when the heap is created.
pub const HEAP_INITIAL_PAGES: u64 = 16;

/// Minimum number of pages added per heap expansion.
pub const HEAP_GROWTH_PAGES: u64 = 16;

/// Where the kernel executes (VMA), matches the linker script.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Physical address the kernel image is loaded at, matches the linker script.
pub const PHYS_LOAD: u64 = 0x0010_0000;

/// First PML4 index of the kernel half. Entries from here up are shared by
/// every address space; entries below belong to the individual space.
pub const KERNEL_HALF_FIRST_INDEX: usize = 256;

/// End (exclusive) of the lower canonical half, where loaded images live.
pub const LOWER_HALF_END: u64 = 1 << 47;

/// Number of entries in each paging structure.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Size of the boot stack the kernel runs on.
pub const KERNEL_STACK_SIZE: usize = 64 * 1024;

/// Size of the stack handed to a loaded image.
pub const IMAGE_STACK_SIZE: usize = 4096;

const _: () = {
    assert!(KERNEL_STACK_SIZE.is_multiple_of(4096));
    assert!(HEAP_BASE.is_multiple_of(PAGE_SIZE));
    assert!(HEAP_MAX_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(HEAP_INITIAL_PAGES * PAGE_SIZE <= HEAP_MAX_SIZE);
    assert!(HEAP_BASE > HHDM_BASE);
    assert!(LOWER_HALF_END == (KERNEL_HALF_FIRST_INDEX as u64) << 39);
    assert!(KERNEL_BASE > HEAP_BASE + HEAP_MAX_SIZE);
    assert!((HHDM_BASE >> 39) & 0x1FF >= KERNEL_HALF_FIRST_INDEX as u64);
    assert!((HEAP_BASE >> 39) & 0x1FF >= KERNEL_HALF_FIRST_INDEX as u64);
};

/// Runtime view of the memory layout.
///
/// The kernel uses [`MemoryLayout::DEFAULT`]; the fields exist so the memory
/// context can be brought up against a different window (for instance a host
/// buffer standing in for the heap).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryLayout {
    /// Offset added to a physical address to reach its HHDM alias.
    pub hhdm_offset: u64,
    /// First byte of the heap window.
    pub heap_base: u64,
    /// Size of the heap window in bytes.
    pub heap_max_size: u64,
    /// Pages committed by heap initialization.
    pub heap_initial_pages: u64,
    /// Minimum pages committed per heap expansion.
    pub heap_growth_pages: u64,
}

impl MemoryLayout {
    pub const DEFAULT: Self = Self {
        hhdm_offset: HHDM_BASE,
        heap_base: HEAP_BASE,
        heap_max_size: HEAP_MAX_SIZE,
        heap_initial_pages: HEAP_INITIAL_PAGES,
        heap_growth_pages: HEAP_GROWTH_PAGES,
    };
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}
