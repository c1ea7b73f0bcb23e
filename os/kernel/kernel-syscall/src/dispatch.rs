use crate::error::encode;
use crate::fat12::{FileInfo, RootDirectory};
use crate::{Services, SyscallError, Sysno};
use core::ffi::{CStr, c_char};
use core::ptr::{self, NonNull};
use kernel_alloc::{HeapError, KernelMemory};
use kernel_info::memory::IMAGE_STACK_SIZE;
use kernel_loader::{RawImage, ValidatedImage};
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::SpinMutex;
use kernel_vmem::{Hhdm, Mmu, PhysMapper, X86Mmu};

/// Executes syscalls against the kernel memory context and `services`.
///
/// The memory lock is taken per step and never held while calling into
/// `services`, so collaborators may allocate and a running image may issue
/// syscalls of its own.
pub struct Syscalls<'a, S: Services + ?Sized, M: PhysMapper = Hhdm, U: Mmu = X86Mmu> {
    memory: &'a SpinMutex<KernelMemory<M, U>>,
    services: &'a mut S,
}

impl<'a, S: Services + ?Sized, M: PhysMapper, U: Mmu> Syscalls<'a, S, M, U> {
    pub const fn new(memory: &'a SpinMutex<KernelMemory<M, U>>, services: &'a mut S) -> Self {
        Self { memory, services }
    }

    /// Decode raw register values, run the call and encode the result.
    ///
    /// # Safety
    /// Every non-null pointer argument must be valid for the access the
    /// call performs: NUL-terminated strings for names and text, a writable
    /// `u32` for the read-file size, `max_entries` writable [`FileInfo`]
    /// records for list-directory and a heap pointer for release.
    pub unsafe fn dispatch(&mut self, nr: u64, args: [u64; 3]) -> i64 {
        let result = Sysno::try_from(nr).and_then(|sysno| unsafe { self.invoke(sysno, args) });
        if let Err(e) = result {
            log::debug!("syscall {nr} failed: {e}");
        }
        encode(result)
    }

    #[allow(clippy::cast_possible_truncation)]
    unsafe fn invoke(&mut self, sysno: Sysno, [a1, a2, _]: [u64; 3]) -> Result<u64, SyscallError> {
        match sysno {
            Sysno::Write => {
                let text = unsafe { c_str(a1) }?;
                self.write(text)?;
                Ok(0)
            }
            Sysno::Allocate => self.allocate(a1).map(|p| p.as_ptr().expose_provenance() as u64),
            Sysno::Release => {
                self.release(NonNull::new(ptr::with_exposed_provenance_mut(a1 as usize)))?;
                Ok(0)
            }
            Sysno::WriteFile => {
                let name = unsafe { c_str(a1) }?;
                let data = unsafe { c_bytes(a2) }?;
                self.write_file(name, data)?;
                Ok(0)
            }
            Sysno::ReadFile => {
                let name = unsafe { c_str(a1) }?;
                let size_out = NonNull::new(ptr::with_exposed_provenance_mut::<u32>(a2 as usize))
                    .ok_or(SyscallError::InvalidArgument)?;
                let (block, size) = self.read_file(name)?;
                unsafe { size_out.write_unaligned(size) };
                Ok(block.as_ptr().expose_provenance() as u64)
            }
            Sysno::Exec => {
                let name = unsafe { c_str(a1) }?;
                self.exec(name)?;
                Ok(0)
            }
            Sysno::ListDirectory => {
                let out = NonNull::new(ptr::with_exposed_provenance_mut::<FileInfo>(a1 as usize))
                    .ok_or(SyscallError::InvalidArgument)?;
                let max = usize::try_from(a2).map_err(|_| SyscallError::InvalidArgument)?;
                let out = unsafe { core::slice::from_raw_parts_mut(out.as_ptr(), max) };
                self.list_directory(out).map(|n| n as u64)
            }
            Sysno::Sleep => {
                self.sleep(a1);
                Ok(0)
            }
        }
    }

    /// # Errors
    /// Never; the console accepts anything.
    pub fn write(&mut self, text: &str) -> Result<(), SyscallError> {
        self.services.write_text(text);
        Ok(())
    }

    /// # Errors
    /// [`SyscallError::InvalidArgument`] for zero bytes,
    /// [`SyscallError::OutOfMemory`] when the heap cannot grow.
    pub fn allocate(&mut self, size: u64) -> Result<NonNull<u8>, SyscallError> {
        let size = usize::try_from(size).map_err(|_| SyscallError::OutOfMemory)?;
        self.memory.lock_irq().alloc(size).map_err(|e| match e {
            HeapError::ZeroSize => SyscallError::InvalidArgument,
            _ => SyscallError::OutOfMemory,
        })
    }

    /// # Errors
    /// [`SyscallError::InvalidArgument`] for null or a pointer that is not
    /// a live allocation.
    pub fn release(&mut self, ptr: Option<NonNull<u8>>) -> Result<(), SyscallError> {
        let ptr = ptr.ok_or(SyscallError::InvalidArgument)?;
        self.memory.lock_irq().free(ptr).map_err(|e| {
            log::warn!("release of {ptr:p} rejected: {e}");
            SyscallError::InvalidArgument
        })
    }

    /// # Errors
    /// [`SyscallError::InvalidArgument`] for an empty name, otherwise what
    /// the file store reports.
    pub fn write_file(&mut self, name: &str, data: &[u8]) -> Result<(), SyscallError> {
        if name.is_empty() {
            return Err(SyscallError::InvalidArgument);
        }
        Ok(self.services.write_file(name, data)?)
    }

    /// Copy the file into a fresh kernel heap block.
    ///
    /// Returns the block and the number of bytes in it. The caller releases
    /// the block.
    ///
    /// # Errors
    /// - [`SyscallError::FileNotFound`].
    /// - [`SyscallError::ReadFailed`] for an empty file or a storage error.
    /// - [`SyscallError::OutOfMemory`] if the block cannot be allocated.
    pub fn read_file(&mut self, name: &str) -> Result<(NonNull<u8>, u32), SyscallError> {
        let size = self.services.file_size(name)?;
        if size == 0 {
            return Err(SyscallError::ReadFailed);
        }
        let block = self.allocate(u64::from(size))?;

        // SAFETY: `block` is a fresh allocation of `size` bytes owned here.
        let buf = unsafe { core::slice::from_raw_parts_mut(block.as_ptr(), size as usize) };
        match self.services.read_file(name, buf) {
            Ok(n) if n > 0 => Ok((block, u32::try_from(n).unwrap_or(size))),
            result => {
                log::warn!("reading {name} failed: {result:?}");
                self.release(Some(block))?;
                Err(SyscallError::ReadFailed)
            }
        }
    }

    /// Load `name` into a new address space, run it and tear the space down.
    ///
    /// The file and the image stack are kernel heap blocks, taken and
    /// released through [`allocate`](Self::allocate) and
    /// [`release`](Self::release). Nothing is allocated or freed through the
    /// global allocator while the memory lock is held.
    ///
    /// # Errors
    /// - [`SyscallError::FileNotFound`] / [`SyscallError::ReadFailed`] if
    ///   the file cannot be read.
    /// - [`SyscallError::InvalidImage`] if it is empty or not a loadable
    ///   ELF64 image.
    /// - [`SyscallError::OutOfMemory`] if the heap cannot hold the file or
    ///   the image stack.
    /// - [`SyscallError::LoadFailed`] if the space or its segments cannot be
    ///   set up; the space is destroyed again and nothing runs.
    pub fn exec(&mut self, name: &str) -> Result<(), SyscallError> {
        let size = self.services.file_size(name)?;
        if size == 0 {
            log::warn!("{name}: empty image");
            return Err(SyscallError::InvalidImage);
        }
        let file = self.allocate(u64::from(size))?;
        let result = self.load_and_run(name, file, size as usize);
        self.release(Some(file))?;
        result
    }

    fn load_and_run(&mut self, name: &str, file: NonNull<u8>, size: usize) -> Result<(), SyscallError> {
        // SAFETY: `file` is a fresh heap block of `size` bytes owned by `exec`.
        let buf = unsafe { core::slice::from_raw_parts_mut(file.as_ptr(), size) };
        let n = self.services.read_file(name, buf)?;

        let image = RawImage::new(&buf[..n]).validate().map_err(|e| {
            log::warn!("{name}: {e}");
            SyscallError::InvalidImage
        })?;

        let stack = self.allocate(IMAGE_STACK_SIZE as u64)?;
        let result = self.run_image(name, &image, stack);
        self.release(Some(stack))?;
        result
    }

    fn run_image(&mut self, name: &str, image: &ValidatedImage<'_>, stack: NonNull<u8>) -> Result<(), SyscallError> {
        let mut space = {
            let mut memory = self.memory.lock_irq();
            let (pmm, vmm, kernel) = memory.parts();
            vmm.create_address_space(pmm, kernel).map_err(|e| {
                log::warn!("{name}: no address space: {e}");
                SyscallError::LoadFailed
            })?
        };

        let executing = {
            let mut memory = self.memory.lock_irq();
            let (pmm, vmm, _) = memory.parts();
            match image.map_into(pmm, vmm, &mut space) {
                Ok(mapped) => mapped.begin_execution(vmm),
                Err(e) => {
                    log::warn!("{name}: {e}");
                    vmm.destroy_address_space(pmm, space);
                    return Err(SyscallError::LoadFailed);
                }
            }
        };

        // Heap blocks are 16-byte aligned and the kernel half, heap included,
        // is shared with `space`.
        let stack_top = VirtualAddress::new(stack.as_ptr().expose_provenance() as u64 + IMAGE_STACK_SIZE as u64);

        // SAFETY: the image was mapped into `space` just above and the stack
        // block stays allocated until the transfer returns.
        let done = unsafe { executing.transfer(&space, stack_top, &mut *self.services) };

        let mut memory = self.memory.lock_irq();
        let (pmm, vmm, _) = memory.parts();
        let freed = vmm.destroy_address_space(pmm, space);
        log::info!("{name} returned {:#x}, {freed} frames reclaimed", done.status);
        Ok(())
    }

    /// Fill `out` with root directory entries; returns how many were written.
    ///
    /// # Errors
    /// [`SyscallError::InvalidArgument`] if `out` is empty,
    /// [`SyscallError::ReadFailed`] if a directory sector cannot be read.
    pub fn list_directory(&mut self, out: &mut [FileInfo]) -> Result<usize, SyscallError> {
        if out.is_empty() {
            return Err(SyscallError::InvalidArgument);
        }
        let mut written = 0;
        for (slot, entry) in out.iter_mut().zip(RootDirectory::new(&mut *self.services)) {
            *slot = FileInfo::from(&entry?);
            written += 1;
        }
        Ok(written)
    }

    /// Zero milliseconds returns at once.
    pub fn sleep(&mut self, ms: u64) {
        if ms > 0 {
            self.services.sleep_ms(ms);
        }
    }
}

/// # Safety
/// A non-zero `addr` must point to a NUL-terminated string.
#[allow(clippy::cast_possible_truncation)]
unsafe fn c_bytes<'s>(addr: u64) -> Result<&'s [u8], SyscallError> {
    let p = ptr::with_exposed_provenance::<c_char>(addr as usize);
    if p.is_null() {
        return Err(SyscallError::InvalidArgument);
    }
    Ok(unsafe { CStr::from_ptr(p) }.to_bytes())
}

/// # Safety
/// See [`c_bytes`].
unsafe fn c_str<'s>(addr: u64) -> Result<&'s str, SyscallError> {
    let bytes = unsafe { c_bytes(addr) }?;
    core::str::from_utf8(bytes).map_err(|_| SyscallError::InvalidArgument)
}
