use crate::context::{KernelMemory, kernel_memory};
use crate::heap::ALIGN;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use kernel_sync::SpinMutex;
use kernel_vmem::{Hhdm, Mmu, PhysMapper, X86Mmu};

type Source<M, U> = fn() -> Option<&'static SpinMutex<KernelMemory<M, U>>>;

/// [`GlobalAlloc`] front for the kernel heap.
///
/// Requests fail (return null) until the memory context is initialized and
/// for alignments above 16 bytes.
///
/// ```no_run
/// # use kernel_alloc::KernelAllocator;
/// #[global_allocator]
/// static ALLOCATOR: KernelAllocator = KernelAllocator::new();
/// ```
pub struct KernelAllocator<M: PhysMapper + 'static = Hhdm, U: Mmu + 'static = X86Mmu> {
    source: Source<M, U>,
}

impl KernelAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self { source: kernel_memory }
    }
}

impl Default for KernelAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: PhysMapper + 'static, U: Mmu + 'static> KernelAllocator<M, U> {
    /// An allocator drawing from whatever `source` yields.
    #[must_use]
    pub const fn over(source: Source<M, U>) -> Self {
        Self { source }
    }

    fn with_memory(&self, layout: Layout, f: impl FnOnce(&mut KernelMemory<M, U>) -> *mut u8) -> *mut u8 {
        if layout.align() > ALIGN {
            return ptr::null_mut();
        }
        match (self.source)() {
            Some(memory) => f(&mut memory.lock_irq()),
            None => ptr::null_mut(),
        }
    }
}

unsafe impl<M: PhysMapper + 'static, U: Mmu + 'static> GlobalAlloc for KernelAllocator<M, U> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.with_memory(layout, |m| {
            m.alloc(layout.size().max(1))
                .map_or(ptr::null_mut(), NonNull::as_ptr)
        })
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let (Some(memory), Some(ptr)) = ((self.source)(), NonNull::new(ptr))
            && let Err(e) = memory.lock_irq().free(ptr)
        {
            log::warn!("dealloc of {ptr:p}: {e}");
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        self.with_memory(layout, |m| {
            m.calloc(1, layout.size().max(1))
                .map_or(ptr::null_mut(), NonNull::as_ptr)
        })
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        self.with_memory(layout, |m| match m.realloc(NonNull::new(ptr), new_size) {
            Ok(Some(p)) => p.as_ptr(),
            Ok(None) | Err(_) => ptr::null_mut(),
        })
    }
}
