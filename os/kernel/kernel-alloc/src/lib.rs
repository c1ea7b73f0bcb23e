//! # Kernel Memory Allocation
//!
//! Physical frames, the kernel heap and the context that ties them to the
//! VMM.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 KernelAllocator                     │
//! │    • GlobalAlloc front for alloc::{Box, Vec}        │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │                      Heap                           │
//! │    • first-fit list of headers over a fixed window  │
//! │    • grows by mapping fresh frames at its end       │
//! └─────────────────┬───────────────────────────────────┘
//!                   │  PagedGrowth
//! ┌─────────────────▼───────────────────────────────────┐
//! │        BitmapFrameAllocator  +  kernel_vmem::Vmm    │
//! │    • one bit per 4 KiB frame                        │
//! │    • page tables reached through the HHDM           │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! [`KernelMemory`] owns all of it. The kernel keeps one instance behind
//! [`init_kernel_memory`] / [`kernel_memory`] and takes it with
//! `lock_irq`, so every mutation runs with interrupts masked.
//!
//! ## Boot order
//!
//! 1. The VMM adopts the live root table (it needs nothing but the HHDM).
//! 2. The PMM builds its bitmap inside the first usable region that can hold
//!    it and runs a short self test.
//! 3. The heap commits its initial pages through the PMM and the VMM.
//!
//! Failing any step is a [`BootError`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod context;
mod error;
mod global;
mod growth;
pub mod heap;
pub mod pmm;

pub use crate::context::{KernelMemory, KernelMemoryCell, init_kernel_memory, kernel_memory};
pub use crate::error::{BootError, HeapError};
pub use crate::global::KernelAllocator;
pub use crate::growth::{HeapGrowth, PagedGrowth};
pub use crate::heap::{Heap, HeapStats};
pub use crate::pmm::BitmapFrameAllocator;
