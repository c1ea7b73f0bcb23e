use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::MapError;

/// Why an image was rejected. Nothing is ever executed after one of these.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum LoadError {
    /// The file ends before a header or table it declares.
    #[error("image is truncated")]
    Truncated,
    #[error("not an ELF image")]
    BadMagic,
    #[error("not a 64-bit ELF image")]
    WrongClass,
    /// A loadable segment is inconsistent or lies outside the lower half.
    #[error("malformed program header")]
    BadProgramHeader,
    #[error("out of physical frames for a segment")]
    AllocationFailed,
    #[error("failed to map segment page: {0}")]
    MappingFailed(MapError),
    /// A page that was just mapped does not resolve in the target space.
    #[error("no translation for {0} in the target space")]
    TranslationFailed(VirtualAddress),
}
