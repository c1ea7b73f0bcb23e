//! Read-only FAT12 access for a 1.44 MiB volume.
//!
//! The geometry is fixed rather than read from the boot sector:
//!
//! ```text
//! sector  0        boot sector
//! sectors 1..10    FAT #1 (12-bit entries)
//! sectors 10..19   FAT #2
//! sectors 19..33   root directory, 16 × 32-byte entries per sector
//! sectors 33..     data, one sector per cluster, cluster 2 first
//! ```

use crate::DirectoryError;
use crate::services::{DeviceError, FileError, FileStore, SectorDevice};
use bitfield_struct::bitfield;
use core::fmt;

pub const SECTOR_SIZE: usize = 512;
pub const FAT_FIRST_SECTOR: u32 = 1;
pub const ROOT_DIR_FIRST_SECTOR: u32 = 19;
pub const ROOT_DIR_SECTORS: u32 = 14;
pub const DATA_FIRST_SECTOR: u32 = ROOT_DIR_FIRST_SECTOR + ROOT_DIR_SECTORS;

const ENTRY_LEN: usize = 32;
const ENTRIES_PER_SECTOR: usize = SECTOR_SIZE / ENTRY_LEN;

/// First name byte of the entry after the last one in use.
const END_OF_DIRECTORY: u8 = 0x00;
const DELETED: u8 = 0xE5;

/// Highest cluster number that can hold data; above are bad/end markers.
const LAST_DATA_CLUSTER: u16 = 0xFF6;

/// Directory entry attribute byte.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct Attributes {
    pub read_only: bool,
    pub hidden: bool,
    pub system: bool,
    pub volume_label: bool,
    pub directory: bool,
    pub archive: bool,
    #[bits(2)]
    __: u8,
}

/// One 32-byte root directory entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DirEntry {
    /// Space padded.
    pub name: [u8; 8],
    /// Space padded.
    pub ext: [u8; 3],
    pub attributes: Attributes,
    pub first_cluster: u16,
    pub size: u32,
}

impl DirEntry {
    fn read(raw: &[u8]) -> Self {
        let mut name = [0; 8];
        let mut ext = [0; 3];
        name.copy_from_slice(&raw[0..8]);
        ext.copy_from_slice(&raw[8..11]);
        Self {
            name,
            ext,
            attributes: Attributes::from_bits(raw[11]),
            first_cluster: u16::from_le_bytes([raw[26], raw[27]]),
            size: u32::from_le_bytes([raw[28], raw[29], raw[30], raw[31]]),
        }
    }

    /// The name as `NAME.EXT`, or `NAME` without an extension.
    #[must_use]
    pub fn short_name(&self) -> ShortName {
        let mut out = [0; 13];
        let mut len = 0;
        for &b in self.name.iter().take_while(|&&b| b != b' ') {
            out[len] = b;
            len += 1;
        }
        if self.ext[0] != b' ' {
            out[len] = b'.';
            len += 1;
            for &b in self.ext.iter().take_while(|&&b| b != b' ') {
                out[len] = b;
                len += 1;
            }
        }
        ShortName(out)
    }
}

/// A rendered 8.3 name, NUL terminated.
#[derive(Copy, Clone, Default, Eq, PartialEq)]
pub struct ShortName([u8; 13]);

impl ShortName {
    /// The name without its terminator.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(self.0.len());
        &self.0[..len]
    }

    #[must_use]
    pub const fn into_inner(self) -> [u8; 13] {
        self.0
    }
}

impl fmt::Display for ShortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in self.as_bytes() {
            fmt::Write::write_char(f, char::from(b))?;
        }
        Ok(())
    }
}

impl fmt::Debug for ShortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// The record `list-directory` writes for each file.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct FileInfo {
    /// `NAME.EXT`, NUL terminated.
    pub name: [u8; 13],
    pub size: u32,
    pub attr: u8,
}

impl FileInfo {
    /// The name without its terminator.
    #[must_use]
    pub fn name(&self) -> &[u8] {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        &self.name[..len]
    }
}

impl From<&DirEntry> for FileInfo {
    fn from(e: &DirEntry) -> Self {
        Self {
            name: e.short_name().into_inner(),
            size: e.size,
            attr: e.attributes.into_bits(),
        }
    }
}

/// Walks the root directory sector by sector.
///
/// Stops at the first never-used entry; deleted entries and the volume
/// label are skipped. Sectors are read lazily, so dropping the iterator
/// early avoids further device reads. A failed read is yielded once and
/// ends the walk.
pub struct RootDirectory<'d, D: SectorDevice + ?Sized> {
    device: &'d mut D,
    buffer: [u8; SECTOR_SIZE],
    /// Root directory sectors read so far.
    sectors_read: u32,
    /// Next entry within `buffer`.
    slot: usize,
    finished: bool,
}

impl<'d, D: SectorDevice + ?Sized> RootDirectory<'d, D> {
    pub const fn new(device: &'d mut D) -> Self {
        Self {
            device,
            buffer: [0; SECTOR_SIZE],
            sectors_read: 0,
            slot: ENTRIES_PER_SECTOR,
            finished: false,
        }
    }
}

impl<D: SectorDevice + ?Sized> Iterator for RootDirectory<'_, D> {
    type Item = Result<DirEntry, DirectoryError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            if self.slot == ENTRIES_PER_SECTOR {
                if self.sectors_read == ROOT_DIR_SECTORS {
                    self.finished = true;
                    break;
                }
                let sector = ROOT_DIR_FIRST_SECTOR + self.sectors_read;
                if self.device.read_sector(sector, &mut self.buffer).is_err() {
                    self.finished = true;
                    return Some(Err(DirectoryError::ReadFailed { sector }));
                }
                self.sectors_read += 1;
                self.slot = 0;
            }

            let at = self.slot * ENTRY_LEN;
            let raw = &self.buffer[at..at + ENTRY_LEN];
            self.slot += 1;

            match raw[0] {
                END_OF_DIRECTORY => self.finished = true,
                DELETED => {}
                _ => {
                    let entry = DirEntry::read(raw);
                    if !entry.attributes.volume_label() {
                        return Some(Ok(entry));
                    }
                }
            }
        }
        None
    }
}

impl<D: SectorDevice + ?Sized> core::iter::FusedIterator for RootDirectory<'_, D> {}

/// Files on a FAT12 volume, looked up in the root directory.
///
/// Writing is not supported.
pub struct Fat12Volume<D> {
    device: D,
    buffer: [u8; SECTOR_SIZE],
    buffered: Option<u32>,
}

impl<D: SectorDevice> Fat12Volume<D> {
    pub const fn new(device: D) -> Self {
        Self {
            device,
            buffer: [0; SECTOR_SIZE],
            buffered: None,
        }
    }

    pub fn into_inner(self) -> D {
        self.device
    }

    pub fn root_directory(&mut self) -> RootDirectory<'_, D> {
        RootDirectory::new(&mut self.device)
    }

    /// The entry named `name`, compared case-insensitively.
    ///
    /// # Errors
    /// [`FileError::NotFound`], or [`FileError::Io`] if the directory could
    /// not be read.
    pub fn find(&mut self, name: &str) -> Result<DirEntry, FileError> {
        for entry in self.root_directory() {
            let entry = entry.map_err(|e| {
                log::warn!("{e}");
                FileError::Io
            })?;
            if entry.short_name().as_bytes().eq_ignore_ascii_case(name.as_bytes()) {
                return Ok(entry);
            }
        }
        Err(FileError::NotFound)
    }

    /// Follow the cluster chain of `entry`, filling `buf` up to the file
    /// size; returns the bytes copied.
    ///
    /// # Errors
    /// [`FileError::Io`] if a sector read fails or the chain ends before the
    /// file does.
    pub fn read(&mut self, entry: &DirEntry, buf: &mut [u8]) -> Result<usize, FileError> {
        let want = buf.len().min(usize::try_from(entry.size).unwrap_or(usize::MAX));
        let mut cluster = entry.first_cluster;
        let mut done = 0;
        while done < want {
            if !(2..=LAST_DATA_CLUSTER).contains(&cluster) {
                log::warn!("{}: cluster chain ends at {cluster:#x} after {done} bytes", entry.short_name());
                return Err(FileError::Io);
            }
            let data = self.sector(DATA_FIRST_SECTOR + u32::from(cluster) - 2)?;
            let n = (want - done).min(SECTOR_SIZE);
            buf[done..done + n].copy_from_slice(&data[..n]);
            done += n;
            if done < want {
                cluster = self.fat_entry(cluster)?;
            }
        }
        Ok(done)
    }

    /// The 12-bit FAT entry of `cluster`: the next cluster or an end marker.
    fn fat_entry(&mut self, cluster: u16) -> Result<u16, FileError> {
        let at = usize::from(cluster) * 3 / 2;
        let raw = u16::from_le_bytes([self.fat_byte(at)?, self.fat_byte(at + 1)?]);
        Ok(if cluster & 1 == 0 { raw & 0x0FFF } else { raw >> 4 })
    }

    #[allow(clippy::cast_possible_truncation)]
    fn fat_byte(&mut self, at: usize) -> Result<u8, FileError> {
        let sector = self.sector(FAT_FIRST_SECTOR + (at / SECTOR_SIZE) as u32)?;
        Ok(sector[at % SECTOR_SIZE])
    }

    fn sector(&mut self, lba: u32) -> Result<&[u8; SECTOR_SIZE], DeviceError> {
        if self.buffered != Some(lba) {
            self.buffered = None;
            self.device.read_sector(lba, &mut self.buffer)?;
            self.buffered = Some(lba);
        }
        Ok(&self.buffer)
    }
}

impl<D: SectorDevice> FileStore for Fat12Volume<D> {
    fn file_size(&mut self, name: &str) -> Result<u32, FileError> {
        self.find(name).map(|e| e.size)
    }

    fn read_file(&mut self, name: &str, buf: &mut [u8]) -> Result<usize, FileError> {
        let entry = self.find(name)?;
        self.read(&entry, buf)
    }

    fn write_file(&mut self, name: &str, _data: &[u8]) -> Result<(), FileError> {
        log::warn!("refusing to write {name}: volume is read-only");
        Err(FileError::ReadOnly)
    }
}

impl<D: SectorDevice> SectorDevice for Fat12Volume<D> {
    fn read_sector(&mut self, lba: u32, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), DeviceError> {
        buf.copy_from_slice(self.sector(lba)?);
        Ok(())
    }
}
