//! # Kernel Image Loader
//!
//! Turns an ELF64 file held in memory into a running image inside a derived
//! address space.
//!
//! * [`elf`]: allocation-free header and table parsing.
//! * [`RawImage`] → [`ValidatedImage`] → [`MappedImage`] → [`Executing`] →
//!   [`Done`]: the load pipeline, one owned type per state.
//! * [`ControlTransfer`]: supplied by the platform to actually jump into the
//!   image.
//!
//! ```no_run
//! # use kernel_loader::{ControlTransfer, LoadError, RawImage};
//! # use kernel_memory_addresses::VirtualAddress;
//! # use kernel_vmem::{AddressSpace, FrameAlloc, Mmu, PhysMapper, Vmm};
//! # fn run<A: FrameAlloc, M: PhysMapper, U: Mmu>(
//! #     bytes: &[u8], stack_top: VirtualAddress, alloc: &mut A, vmm: &Vmm<M, U>,
//! #     space: &mut AddressSpace, cpu: &mut impl ControlTransfer,
//! # ) -> Result<i64, LoadError> {
//! let image = RawImage::new(bytes).validate()?.map_into(alloc, vmm, space)?;
//! let done = unsafe { image.execute(vmm, space, stack_top, cpu) };
//! # Ok(done.status)
//! # }
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod elf;
mod error;
mod image;
mod transfer;

pub use crate::error::LoadError;
pub use crate::image::{Done, Executing, MappedImage, RawImage, ValidatedImage};
pub use crate::transfer::ControlTransfer;
