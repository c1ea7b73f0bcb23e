//! # Memory Page Table

use crate::PageTableEntry;
use kernel_info::memory::{ENTRIES_PER_TABLE, KERNEL_HALF_FIRST_INDEX};

/// One 4 KiB paging structure: 512 entries, page aligned.
///
/// The same layout serves as PML4, PDPT, PD and PT.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    /// A table with every entry not present.
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageTableEntry::EMPTY; ENTRIES_PER_TABLE],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: usize) -> PageTableEntry {
        self.entries[i]
    }

    #[inline]
    pub const fn set(&mut self, i: usize, e: PageTableEntry) {
        self.entries[i] = e;
    }

    #[inline]
    pub const fn clear(&mut self, i: usize) {
        self.entries[i] = PageTableEntry::EMPTY;
    }

    /// Mark every entry not present.
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::EMPTY);
    }

    /// Entries owned by an individual address space (PML4 only).
    pub fn lower_half(&self) -> impl Iterator<Item = (usize, PageTableEntry)> + '_ {
        self.entries[..KERNEL_HALF_FIRST_INDEX]
            .iter()
            .copied()
            .enumerate()
    }

    /// Copy the shared kernel-half entries of `kernel` into this table.
    pub fn share_upper_half(&mut self, kernel: &Self) {
        self.entries[KERNEL_HALF_FIRST_INDEX..]
            .copy_from_slice(&kernel.entries[KERNEL_HALF_FIRST_INDEX..]);
    }

    /// Present entries with their index.
    pub fn present(&self) -> impl Iterator<Item = (usize, PageTableEntry)> + '_ {
        self.entries
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, e)| e.present())
    }
}
