use crate::services::FileError;

/// Errors reported to syscall callers as negative return values.
///
/// Every other return value is a payload (a count, a size or an address),
/// including addresses in the upper half that read as negative `i64`.
#[repr(i64)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum SyscallError {
    /// A null pointer, zero size, bad string or unknown syscall number.
    #[error("invalid argument")]
    InvalidArgument = -1,
    #[error("file not found")]
    FileNotFound = -2,
    /// The storage behind a file or the directory failed.
    #[error("storage operation failed")]
    ReadFailed = -3,
    #[error("not a loadable image")]
    InvalidImage = -4,
    /// The image was valid but could not be placed in memory.
    #[error("failed to load image")]
    LoadFailed = -5,
    #[error("out of memory")]
    OutOfMemory = -6,
}

impl SyscallError {
    /// The value returned to the caller.
    #[must_use]
    pub const fn code(self) -> i64 {
        self as i64
    }

    #[must_use]
    pub const fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            -1 => Self::InvalidArgument,
            -2 => Self::FileNotFound,
            -3 => Self::ReadFailed,
            -4 => Self::InvalidImage,
            -5 => Self::LoadFailed,
            -6 => Self::OutOfMemory,
            _ => return None,
        })
    }
}

impl From<FileError> for SyscallError {
    fn from(e: FileError) -> Self {
        match e {
            FileError::NotFound => Self::FileNotFound,
            FileError::Io | FileError::ReadOnly => Self::ReadFailed,
        }
    }
}

impl From<DirectoryError> for SyscallError {
    fn from(_: DirectoryError) -> Self {
        Self::ReadFailed
    }
}

/// Fold a syscall result into its register value.
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub fn encode(result: Result<u64, SyscallError>) -> i64 {
    match result {
        Ok(value) => value as i64,
        Err(e) => e.code(),
    }
}

/// Split a register value back into payload or error.
///
/// # Errors
/// The [`SyscallError`] whose code `ret` is.
#[allow(clippy::cast_sign_loss)]
pub const fn decode(ret: i64) -> Result<u64, SyscallError> {
    match SyscallError::from_code(ret) {
        Some(e) => Err(e),
        None => Ok(ret as u64),
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum DirectoryError {
    #[error("failed to read directory sector {sector}")]
    ReadFailed { sector: u32 },
}
