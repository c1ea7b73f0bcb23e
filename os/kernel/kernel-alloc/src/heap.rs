//! # Kernel Heap
//!
//! A first-fit allocator over a reserved virtual window. Every block starts
//! with a [`BlockHeader`]; headers form an address-ordered doubly linked list
//! that tiles the committed part of the window without gaps:
//!
//! ```text
//! base                                                    base + committed
//! ┌────────┬───────────┬────────┬──────────────┬────────┬─────────────┐
//! │ header │ payload 0 │ header │  payload 1   │ header │  payload 2  │
//! └────────┴───────────┴────────┴──────────────┴────────┴─────────────┘
//!  block 0               block 1                 block 2 (tail)
//! ```
//!
//! `address(next) == address(block) + HEADER + block.size` holds for every
//! block. When no block fits, the window is extended through a [`HeapGrowth`]
//! and the request is retried once.

use crate::{HeapError, HeapGrowth};
use core::ptr::{self, NonNull};
use kernel_info::memory::MemoryLayout;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, pages_for};

/// Payload alignment and size granularity.
pub const ALIGN: usize = 16;

/// Bytes occupied by a block header.
pub const HEADER: usize = size_of::<BlockHeader>();

#[allow(clippy::cast_possible_truncation)]
const PAGE: usize = PAGE_SIZE as usize;

const _: () = assert!(HEADER.is_multiple_of(ALIGN));

/// Byte offset of a block header from the heap base.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct BlockHandle(usize);

#[repr(C, align(16))]
struct BlockHeader {
    /// Usable bytes following the header.
    size: usize,
    prev: Option<BlockHandle>,
    next: Option<BlockHandle>,
    used: bool,
}

/// Snapshot of one block, in list order.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BlockInfo {
    /// Offset of the header from the heap base.
    pub offset: usize,
    pub size: usize,
    pub used: bool,
}

/// Heap occupancy in bytes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HeapStats {
    /// Everything committed to the heap.
    pub total: usize,
    /// Headers and payloads of used blocks.
    pub used: usize,
    pub free: usize,
}

pub struct Heap {
    base: usize,
    committed: usize,
    max_size: usize,
    growth_pages: u64,
    head: Option<BlockHandle>,
    tail: Option<BlockHandle>,
}

// SAFETY: the heap owns its window; all access goes through `&mut self`.
unsafe impl Send for Heap {}

impl Heap {
    /// Commit the initial pages of the window described by `layout` and
    /// cover them with one free block.
    ///
    /// # Errors
    /// [`HeapError::WindowExhausted`] if the initial pages exceed the window,
    /// otherwise whatever `growth` reports.
    #[allow(clippy::cast_possible_truncation)]
    pub fn init(layout: &MemoryLayout, growth: &mut impl HeapGrowth) -> Result<Self, HeapError> {
        let initial = layout.heap_initial_pages.max(1);
        if initial * PAGE_SIZE > layout.heap_max_size {
            return Err(HeapError::WindowExhausted);
        }

        growth.grow(VirtualAddress::new(layout.heap_base), initial)?;

        let committed = (initial * PAGE_SIZE) as usize;
        let mut heap = Self {
            base: layout.heap_base as usize,
            committed,
            max_size: layout.heap_max_size as usize,
            growth_pages: layout.heap_growth_pages,
            head: Some(BlockHandle(0)),
            tail: Some(BlockHandle(0)),
        };
        heap.write_header(BlockHandle(0), committed - HEADER, None, None);

        log::info!(
            "heap at {:#x}: {} KiB committed, window {} MiB",
            heap.base,
            committed / 1024,
            heap.max_size / 1024 / 1024
        );
        Ok(heap)
    }

    /// First byte of the heap window.
    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    /// Allocate `size` bytes, 16-byte aligned.
    ///
    /// # Errors
    /// - [`HeapError::ZeroSize`] for `size == 0`.
    /// - Any expansion failure if no block fits.
    pub fn alloc(&mut self, size: usize, growth: &mut impl HeapGrowth) -> Result<NonNull<u8>, HeapError> {
        if size == 0 {
            return Err(HeapError::ZeroSize);
        }
        let size = size
            .checked_next_multiple_of(ALIGN)
            .ok_or(HeapError::WindowExhausted)?;

        if let Some(block) = self.find_fit(size) {
            return Ok(self.take(block, size));
        }

        self.expand(size, growth)?;
        let block = self.find_fit(size).ok_or(HeapError::WindowExhausted)?;
        Ok(self.take(block, size))
    }

    /// Release the block holding `ptr` and merge it with free neighbours.
    ///
    /// # Errors
    /// [`HeapError::NotAllocated`] for pointers that are not a live
    /// allocation (foreign or already freed); nothing is changed.
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let block = self.used_block_of(ptr)?;
        self.set_used(block, false);

        let mut block = block;
        if let Some(prev) = self.hdr(block).prev
            && !self.hdr(prev).used
        {
            self.absorb_next(prev);
            block = prev;
        }
        if let Some(next) = self.hdr(block).next
            && !self.hdr(next).used
        {
            self.absorb_next(block);
        }
        Ok(())
    }

    /// Allocate `count * size` zeroed bytes.
    ///
    /// # Errors
    /// As [`alloc`](Self::alloc); an overflowing product is
    /// [`HeapError::WindowExhausted`].
    pub fn calloc(
        &mut self,
        count: usize,
        size: usize,
        growth: &mut impl HeapGrowth,
    ) -> Result<NonNull<u8>, HeapError> {
        let bytes = count.checked_mul(size).ok_or(HeapError::WindowExhausted)?;
        let ptr = self.alloc(bytes, growth)?;
        let block = self.handle_of(ptr);
        let len = self.hdr(block).size;
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, len) };
        Ok(ptr)
    }

    /// Resize an allocation.
    ///
    /// - `None` behaves like [`alloc`](Self::alloc).
    /// - `new_size == 0` frees `ptr` and returns `None`.
    /// - A block that is already large enough is returned unchanged.
    /// - Otherwise the contents move to a new block and the old one is freed.
    ///
    /// # Errors
    /// [`HeapError::NotAllocated`] for a pointer that is not live, or any
    /// allocation failure; the original block is untouched in that case.
    pub fn realloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        growth: &mut impl HeapGrowth,
    ) -> Result<Option<NonNull<u8>>, HeapError> {
        let Some(old) = ptr else {
            return self.alloc(new_size, growth).map(Some);
        };
        if new_size == 0 {
            self.free(old)?;
            return Ok(None);
        }

        let block = self.used_block_of(old)?;
        let old_size = self.hdr(block).size;
        if old_size >= new_size {
            return Ok(Some(old));
        }

        let new = self.alloc(new_size, growth)?;
        unsafe { ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), old_size) };
        self.free(old)?;
        Ok(Some(new))
    }

    /// Committed, used and free bytes.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let used = self
            .blocks()
            .filter(|b| b.used)
            .map(|b| HEADER + b.size)
            .sum();
        HeapStats {
            total: self.committed,
            used,
            free: self.committed - used,
        }
    }

    /// Every block from the lowest address up.
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        core::iter::successors(self.head, |&h| self.hdr(h).next).map(|h| {
            let hdr = self.hdr(h);
            BlockInfo {
                offset: h.0,
                size: hdr.size,
                used: hdr.used,
            }
        })
    }

    fn find_fit(&self, size: usize) -> Option<BlockHandle> {
        core::iter::successors(self.head, |&h| self.hdr(h).next).find(|&h| {
            let hdr = self.hdr(h);
            !hdr.used && hdr.size >= size
        })
    }

    /// Mark `block` used, splitting off a free tail if the rest is worth it.
    fn take(&mut self, block: BlockHandle, size: usize) -> NonNull<u8> {
        let (total, next) = {
            let hdr = self.hdr(block);
            (hdr.size, hdr.next)
        };

        let remaining = total - size;
        if remaining >= HEADER + ALIGN {
            let tail = BlockHandle(block.0 + HEADER + size);
            self.write_header(tail, remaining - HEADER, Some(block), next);
            match next {
                Some(n) => self.hdr_mut(n).prev = Some(tail),
                None => self.tail = Some(tail),
            }
            let hdr = self.hdr_mut(block);
            hdr.next = Some(tail);
            hdr.size = size;
        }

        self.set_used(block, true);
        self.payload(block)
    }

    /// Merge the successor of `block` into it. The successor must exist.
    fn absorb_next(&mut self, block: BlockHandle) {
        let Some(next) = self.hdr(block).next else {
            return;
        };
        let (next_size, after) = {
            let n = self.hdr(next);
            (n.size, n.next)
        };
        {
            let hdr = self.hdr_mut(block);
            hdr.size += HEADER + next_size;
            hdr.next = after;
        }
        match after {
            Some(a) => self.hdr_mut(a).prev = Some(block),
            None => self.tail = Some(block),
        }
    }

    /// Commit more of the window so that a `size`-byte block fits at the end.
    fn expand(&mut self, size: usize, growth: &mut impl HeapGrowth) -> Result<(), HeapError> {
        let needed = pages_for(size.saturating_add(HEADER) as u64);
        let available = ((self.max_size - self.committed) / PAGE) as u64;
        if needed > available {
            log::warn!("heap window exhausted: need {needed} pages, {available} left");
            return Err(HeapError::WindowExhausted);
        }
        let pages = needed.max(self.growth_pages).min(available);

        let at = VirtualAddress::new((self.base + self.committed) as u64);
        growth.grow(at, pages)?;

        #[allow(clippy::cast_possible_truncation)]
        let added = pages as usize * PAGE;
        let old_end = self.committed;
        self.committed += added;

        let tail = self.tail;
        match tail {
            Some(t) if !self.hdr(t).used => self.hdr_mut(t).size += added,
            tail => {
                let new = BlockHandle(old_end);
                self.write_header(new, added - HEADER, tail, None);
                match tail {
                    Some(t) => self.hdr_mut(t).next = Some(new),
                    None => self.head = Some(new),
                }
                self.tail = Some(new);
            }
        }

        log::debug!("heap expanded by {pages} pages to {} KiB", self.committed / 1024);
        Ok(())
    }

    /// The block whose payload starts at `ptr`, if it is a live allocation.
    fn used_block_of(&self, ptr: NonNull<u8>) -> Result<BlockHandle, HeapError> {
        let addr = ptr.as_ptr().addr();
        let in_window = addr >= self.base + HEADER && addr < self.base + self.committed;
        let found = in_window
            .then(|| BlockHandle(addr - self.base - HEADER))
            .and_then(|want| core::iter::successors(self.head, |&h| self.hdr(h).next).find(|&h| h == want));

        match found {
            Some(block) if self.hdr(block).used => Ok(block),
            Some(_) => {
                log::warn!("double free of heap pointer {addr:#x}");
                Err(HeapError::NotAllocated)
            }
            None => {
                log::warn!("free of foreign pointer {addr:#x}");
                Err(HeapError::NotAllocated)
            }
        }
    }

    fn handle_of(&self, ptr: NonNull<u8>) -> BlockHandle {
        BlockHandle(ptr.as_ptr().addr() - self.base - HEADER)
    }

    fn payload(&self, block: BlockHandle) -> NonNull<u8> {
        let p = ptr::with_exposed_provenance_mut::<u8>(self.base + block.0 + HEADER);
        // SAFETY: the window never starts at address zero.
        unsafe { NonNull::new_unchecked(p) }
    }

    fn header_ptr(&self, block: BlockHandle) -> *mut BlockHeader {
        ptr::with_exposed_provenance_mut(self.base + block.0)
    }

    fn hdr(&self, block: BlockHandle) -> &BlockHeader {
        // SAFETY: handles only ever name headers inside the committed window.
        unsafe { &*self.header_ptr(block) }
    }

    fn hdr_mut(&mut self, block: BlockHandle) -> &mut BlockHeader {
        unsafe { &mut *self.header_ptr(block) }
    }

    fn set_used(&mut self, block: BlockHandle, used: bool) {
        self.hdr_mut(block).used = used;
    }

    fn write_header(
        &mut self,
        block: BlockHandle,
        size: usize,
        prev: Option<BlockHandle>,
        next: Option<BlockHandle>,
    ) {
        let header = BlockHeader {
            size,
            prev,
            next,
            used: false,
        };
        unsafe { self.header_ptr(block).write(header) };
    }
}
