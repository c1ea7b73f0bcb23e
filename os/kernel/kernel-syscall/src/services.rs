//! What the syscall layer needs from the rest of the system.
//!
//! The kernel provides one value implementing all of these; tests provide
//! doubles. [`Services`] is the bundle, implemented for anything that has
//! every part.

use crate::fat12::SECTOR_SIZE;
use kernel_loader::ControlTransfer;

/// Text output for the `write` syscall.
pub trait Console {
    fn write_text(&mut self, text: &str);
}

/// Named files on the boot volume.
pub trait FileStore {
    /// Size in bytes of the file called `name`.
    ///
    /// # Errors
    /// [`FileError::NotFound`] if there is no such file.
    fn file_size(&mut self, name: &str) -> Result<u32, FileError>;

    /// Copy the start of the file into `buf`; returns the bytes copied.
    ///
    /// # Errors
    /// [`FileError::NotFound`] or [`FileError::Io`].
    fn read_file(&mut self, name: &str, buf: &mut [u8]) -> Result<usize, FileError>;

    /// Create or replace the file called `name`.
    ///
    /// # Errors
    /// Whatever kept the file from being written.
    fn write_file(&mut self, name: &str, data: &[u8]) -> Result<(), FileError>;
}

/// Raw 512-byte sectors of the boot volume.
pub trait SectorDevice {
    /// # Errors
    /// [`DeviceError`] if `lba` is out of range or the device failed.
    fn read_sector(&mut self, lba: u32, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), DeviceError>;
}

pub trait Timer {
    /// Block for at least `ms` milliseconds.
    fn sleep_ms(&mut self, ms: u64);
}

/// Everything a syscall may call out to.
pub trait Services: Console + FileStore + SectorDevice + Timer + ControlTransfer {}

impl<T: Console + FileStore + SectorDevice + Timer + ControlTransfer + ?Sized> Services for T {}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FileError {
    #[error("file not found")]
    NotFound,
    #[error("I/O error")]
    Io,
    #[error("volume is read-only")]
    ReadOnly,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("sector device error")]
pub struct DeviceError;

impl From<DeviceError> for FileError {
    fn from(_: DeviceError) -> Self {
        Self::Io
    }
}
