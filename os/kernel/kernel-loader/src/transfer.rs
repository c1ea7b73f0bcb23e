use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::AddressSpace;

/// The platform's way of running a mapped image.
///
/// An implementation switches to `space`, moves onto the stack ending at
/// `stack_top`, jumps to `entry` and, if the image returns by the calling
/// convention, switches back to the kernel space and stack before returning.
/// The stack is owned by the caller.
pub trait ControlTransfer {
    /// Run the image and return what it left in its return register.
    ///
    /// # Safety
    /// `entry` must be mapped executable in `space`, and `space` must share
    /// the kernel half so the kernel keeps running across the switch.
    /// `stack_top` must be the 16-byte aligned end of a writable stack that
    /// is mapped in `space`.
    unsafe fn enter(&mut self, space: &AddressSpace, entry: VirtualAddress, stack_top: VirtualAddress) -> i64;
}

impl<T: ControlTransfer + ?Sized> ControlTransfer for &mut T {
    unsafe fn enter(&mut self, space: &AddressSpace, entry: VirtualAddress, stack_top: VirtualAddress) -> i64 {
        unsafe { (**self).enter(space, entry, stack_top) }
    }
}
