use kernel_vmem::MapError;

/// Why the heap could not satisfy a request.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("zero-sized allocation")]
    ZeroSize,
    /// The request does not fit in what is left of the heap window.
    #[error("heap window exhausted")]
    WindowExhausted,
    #[error("out of physical frames")]
    OutOfFrames,
    #[error("failed to map heap page: {0}")]
    MappingFailed(MapError),
    /// The pointer does not name a live allocation.
    #[error("pointer is not a live heap allocation")]
    NotAllocated,
}

impl From<MapError> for HeapError {
    fn from(e: MapError) -> Self {
        match e {
            MapError::OutOfFrames => Self::OutOfFrames,
            other => Self::MappingFailed(other),
        }
    }
}

/// Conditions that stop the kernel from bringing up memory management.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BootError {
    #[error("no usable region can hold the frame bitmap")]
    NoBitmapRegion,
    #[error("no kernel root page table")]
    NoKernelRoot,
    #[error("heap initialization failed: {0}")]
    Heap(#[from] HeapError),
}
