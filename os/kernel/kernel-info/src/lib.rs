//! # Kernel Configuration and Boot Interface
//!
//! Shared constants and handoff types: what the bootloader tells the kernel
//! about physical memory, and where the kernel places its own virtual regions.
//!
//! ## Boot Information ([`boot`])
//! * [`KernelBootInfo`](boot::KernelBootInfo): the `#[repr(C)]` structure the
//!   loader passes to the kernel entry point.
//! * [`MemoryRegion`](boot::MemoryRegion): one `{base, length, kind}` entry of
//!   the boot memory map, decoded from raw UEFI descriptors by
//!   [`EfiMemoryMap`](boot::EfiMemoryMap).
//!
//! ## Memory Layout ([`memory`])
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │   Per-address-space mappings    │  PML4[0..256]
//!                       │   (loaded images, their stacks) │
//! 0x0000_7fff_ffff_ffff ├─────────────────────────────────┤
//!                       │    non-canonical hole           │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Higher Half Direct Mapping    │  PML4[256..512],
//!                       │   (all physical memory)         │  shared by every
//! HEAP_BASE             ├─────────────────────────────────┤  address space
//!                       │   Kernel heap window            │ 0xffff_c000_0000_0000
//!                       │   (HEAP_MAX_SIZE bytes)         │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │       Kernel Text & Data        │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! The constants double as the kernel's configuration; they are grouped in
//! [`MemoryLayout`](memory::MemoryLayout) for code that wants them as a value.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod boot;
pub mod memory;
