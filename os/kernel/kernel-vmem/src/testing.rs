//! Host-side stand-ins for physical memory and the MMU.
//!
//! [`FakePhysicalMemory`] is a zeroed, page-aligned host buffer whose first
//! byte plays physical address `0`. Its [`Hhdm`] uses the buffer's host
//! address as the offset, so code under test goes through the same
//! `pa + offset` translation it uses on hardware.

use crate::{FRAME_BYTES, FrameAlloc, Hhdm, Mmu};
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::ptr::NonNull;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};

#[derive(Clone)]
#[repr(C, align(4096))]
struct Frame4K([u8; FRAME_BYTES]);

/// A run of zeroed 4 KiB frames standing in for RAM.
///
/// The buffer is never moved while the value lives, so addresses derived from
/// [`hhdm`](Self::hhdm) stay valid until drop.
pub struct FakePhysicalMemory {
    frames: NonNull<[Frame4K]>,
}

impl FakePhysicalMemory {
    /// `frames` zeroed frames at physical addresses `0..frames * 4096`.
    #[must_use]
    pub fn new(frames: usize) -> Self {
        let boxed = vec![Frame4K([0; FRAME_BYTES]); frames].into_boxed_slice();
        let frames = NonNull::from(Box::leak(boxed));
        Self { frames }
    }

    /// The direct map for this memory.
    #[must_use]
    pub fn hhdm(&self) -> Hhdm {
        Hhdm::new(self.frames.cast::<u8>().as_ptr().expose_provenance() as u64)
    }

    /// Number of frames.
    #[must_use]
    pub const fn frames(&self) -> usize {
        self.frames.len()
    }

    /// Size in bytes.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.frames() as u64 * PAGE_SIZE
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    /// Read `len` bytes at physical address `pa`.
    ///
    /// # Panics
    /// If the range is outside the buffer.
    #[must_use]
    pub fn read(&self, pa: PhysicalAddress, len: usize) -> &[u8] {
        let start = usize::try_from(pa.as_u64()).expect("address fits usize");
        assert!(start + len <= self.frames() * FRAME_BYTES, "read past fake memory");
        unsafe { core::slice::from_raw_parts(self.frames.cast::<u8>().as_ptr().add(start), len) }
    }

    /// Copy `bytes` to physical address `pa`.
    ///
    /// # Panics
    /// If the range is outside the buffer.
    pub fn write(&mut self, pa: PhysicalAddress, bytes: &[u8]) {
        let start = usize::try_from(pa.as_u64()).expect("address fits usize");
        assert!(start + bytes.len() <= self.frames() * FRAME_BYTES, "write past fake memory");
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.frames.cast::<u8>().as_ptr().add(start),
                bytes.len(),
            );
        }
    }
}

impl Drop for FakePhysicalMemory {
    fn drop(&mut self) {
        // SAFETY: created by `Box::leak` in `new` and never freed elsewhere.
        drop(unsafe { Box::from_raw(self.frames.as_ptr()) });
    }
}

/// Hands out frames `first..first + count` in order and records returns.
///
/// Freed frames are not reused, which keeps ownership checks simple.
#[derive(Debug)]
pub struct BumpFrames {
    next: u64,
    end: u64,
    allocated: usize,
    freed: Vec<PhysicalAddress>,
}

impl BumpFrames {
    #[must_use]
    pub const fn new(first: u64, count: u64) -> Self {
        Self {
            next: first,
            end: first + count,
            allocated: 0,
            freed: Vec::new(),
        }
    }

    /// Frames handed out so far.
    #[must_use]
    pub const fn allocated(&self) -> usize {
        self.allocated
    }

    /// Frames returned so far, in order.
    #[must_use]
    pub fn freed(&self) -> &[PhysicalAddress] {
        &self.freed
    }

    /// Frames still available.
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.end - self.next
    }
}

impl FrameAlloc for BumpFrames {
    fn alloc_frame(&mut self) -> Option<PhysicalAddress> {
        if self.next == self.end {
            return None;
        }
        let pa = PhysicalAddress::new(self.next * PAGE_SIZE);
        self.next += 1;
        self.allocated += 1;
        Some(pa)
    }

    fn free_frame(&mut self, pa: PhysicalAddress) {
        assert!(!self.freed.contains(&pa), "frame {pa} freed twice");
        self.freed.push(pa);
    }
}

/// An [`Mmu`] that only records what it was asked to do.
#[derive(Debug, Default)]
pub struct RecordingMmu {
    invalidated: RefCell<Vec<VirtualAddress>>,
    flushes: Cell<usize>,
    root: Cell<PhysicalAddress>,
}

impl RecordingMmu {
    /// A recorder that reports `root` as the active root table.
    #[must_use]
    pub fn with_root(root: PhysicalAddress) -> Self {
        Self {
            root: Cell::new(root),
            ..Self::default()
        }
    }

    /// Every page passed to `invalidate_page`, in order.
    #[must_use]
    pub fn invalidated(&self) -> Vec<VirtualAddress> {
        self.invalidated.borrow().clone()
    }

    /// Number of full flushes.
    #[must_use]
    pub fn flushes(&self) -> usize {
        self.flushes.get()
    }

    /// The last root loaded.
    #[must_use]
    pub fn root(&self) -> PhysicalAddress {
        self.root.get()
    }
}

impl Mmu for RecordingMmu {
    fn invalidate_page(&self, va: VirtualAddress) {
        self.invalidated.borrow_mut().push(va);
    }

    fn flush_all(&self) {
        self.flushes.set(self.flushes.get() + 1);
    }

    fn current_root(&self) -> PhysicalAddress {
        self.root.get()
    }

    unsafe fn load_root(&self, root: PhysicalAddress) {
        self.root.set(root);
    }
}
