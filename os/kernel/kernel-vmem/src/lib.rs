//! # Virtual Memory Support
//!
//! Four-level x86-64 paging for the kernel: page-table entries and tables,
//! the higher-half direct map (HHDM) used to reach physical memory, and the
//! [`Vmm`] that builds, edits and tears down address spaces.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! Each 48-bit virtual address is divided into five fields:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! The CPU uses these fields as **indices** into four levels of page tables,
//! each level containing 512 entries of 8 bytes each.
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │        │
//!   │        │        │        └───► PTE   → maps 4 KiB page
//!   │        │        └────────────► PDE   → PS=1 → 2 MiB page
//!   │        └─────────────────────► PDPTE → PS=1 → 1 GiB page
//!   └──────────────────────────────► PML4E
//! ```
//!
//! ## Address spaces
//!
//! The kernel owns one root table whose upper half (PML4 indices 256..512)
//! holds the HHDM, the heap window and the kernel image. Every derived space
//! copies those upper-half entries verbatim and starts with an empty lower
//! half. A derived space owns exactly the frames reachable through its lower
//! half; the upper half is shared and never freed through it.
//!
//! ## Collaborators
//!
//! - [`FrameAlloc`] supplies and takes back physical frames.
//! - [`PhysMapper`] turns physical addresses into dereferenceable pointers.
//! - [`Mmu`] keeps the TLB and CR3 in sync with table edits.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(any(test, feature = "testing"))]
extern crate alloc;

mod address_space;
mod entry;
mod error;
mod mapper;
mod mmu;
mod page_table;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
mod vmm;

pub use crate::address_space::AddressSpace;
pub use crate::entry::PageTableEntry;
pub use crate::error::MapError;
pub use crate::mapper::{FRAME_BYTES, Hhdm, PhysMapper};
pub use crate::mmu::{Mmu, X86Mmu};
pub use crate::page_table::PageTable;
pub use crate::vmm::Vmm;

use kernel_memory_addresses::PhysicalAddress;

/// Source and sink of 4 KiB physical frames.
pub trait FrameAlloc {
    /// One frame, or `None` when physical memory is exhausted.
    fn alloc_frame(&mut self) -> Option<PhysicalAddress>;

    /// Return a frame previously handed out by [`alloc_frame`](Self::alloc_frame).
    fn free_frame(&mut self, pa: PhysicalAddress);
}
