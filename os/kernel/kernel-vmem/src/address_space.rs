use kernel_memory_addresses::PhysicalAddress;

/// Handle to one page-table hierarchy, named by its root (PML4) frame.
///
/// Handles are not `Clone`: a derived space is owned by whoever created it
/// and is torn down by passing the handle back to
/// [`Vmm::destroy_address_space`](crate::Vmm::destroy_address_space).
#[derive(Debug, PartialEq, Eq)]
pub struct AddressSpace {
    root: PhysicalAddress,
    kind: SpaceKind,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SpaceKind {
    /// Built once at boot, never destroyed; owns the shared upper half.
    Kernel,
    /// Borrows the kernel's upper half, owns its lower half.
    Derived,
}

impl AddressSpace {
    /// Adopt `root` as the kernel address space.
    ///
    /// # Safety
    /// `root` must be a valid PML4 frame that lives for the rest of the
    /// kernel's lifetime. Only one kernel space may exist.
    #[must_use]
    pub const unsafe fn kernel(root: PhysicalAddress) -> Self {
        Self {
            root,
            kind: SpaceKind::Kernel,
        }
    }

    pub(crate) const fn derived(root: PhysicalAddress) -> Self {
        Self {
            root,
            kind: SpaceKind::Derived,
        }
    }

    /// Physical address of the PML4 frame.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn is_kernel(&self) -> bool {
        matches!(self.kind, SpaceKind::Kernel)
    }
}
