/// Why a page-table operation failed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    /// No frame was available for a missing intermediate table.
    #[error("out of physical frames for page tables")]
    OutOfFrames,
    /// Some level of the walk was not present.
    #[error("address is not mapped")]
    NotMapped,
    /// The walk ended in a 1 GiB or 2 MiB page.
    #[error("address is covered by a huge page")]
    HugePage,
    /// A virtual or physical address was not page aligned.
    #[error("address is not page aligned")]
    Unaligned,
    /// A range operation found a page that is already mapped.
    #[error("address is already mapped")]
    AlreadyMapped,
    /// A range runs past the end of the address space.
    #[error("range wraps around the address space")]
    Overflow,
}
