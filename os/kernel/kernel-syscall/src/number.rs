use crate::SyscallError;

/// Syscall numbers, passed in the first register.
#[repr(u64)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Sysno {
    /// Print a NUL-terminated string to the console.
    Write = 1,
    /// Allocate bytes from the kernel heap.
    Allocate = 2,
    /// Return an allocation to the kernel heap.
    Release = 3,
    WriteFile = 4,
    /// Copy a file into a fresh heap block.
    ReadFile = 5,
    /// Load an ELF image and run it in its own address space.
    Exec = 6,
    /// List the root directory of the boot volume.
    ListDirectory = 7,
    Sleep = 8,
}

impl TryFrom<u64> for Sysno {
    type Error = SyscallError;

    fn try_from(nr: u64) -> Result<Self, Self::Error> {
        Ok(match nr {
            1 => Self::Write,
            2 => Self::Allocate,
            3 => Self::Release,
            4 => Self::WriteFile,
            5 => Self::ReadFile,
            6 => Self::Exec,
            7 => Self::ListDirectory,
            8 => Self::Sleep,
            _ => return Err(SyscallError::InvalidArgument),
        })
    }
}
