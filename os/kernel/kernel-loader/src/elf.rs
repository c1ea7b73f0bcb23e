//! ELF64 header and table parsing.
//!
//! Everything here works on a borrowed byte slice and never allocates. Field
//! reads are little-endian and bounds-checked at the table level, so a
//! [`ProgramHeader`] or [`SectionHeader`] only exists if all of its bytes do.

use crate::LoadError;
use bitfield_struct::bitfield;
use core::iter::FusedIterator;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// `e_ident[0..4]`.
pub const ELF_MAGIC: [u8; 4] = *b"\x7FELF";

/// `e_ident[EI_CLASS]` for 64-bit objects.
pub const ELFCLASS64: u8 = 2;

/// Size of the ELF64 file header.
pub const HEADER_LEN: usize = 64;

/// Size of one `Elf64_Phdr`.
pub const PROGRAM_HEADER_LEN: usize = 56;

/// Size of one `Elf64_Shdr`.
pub const SECTION_HEADER_LEN: usize = 64;

/// Loadable segment.
pub const PT_LOAD: u32 = 1;

#[inline]
fn le16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

#[inline]
fn le32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

#[inline]
fn le64(b: &[u8], at: usize) -> u64 {
    u64::from(le32(b, at)) | (u64::from(le32(b, at + 4)) << 32)
}

/// The ELF64 file header.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ElfHeader {
    /// `e_type`: 2 for executables, 3 for shared objects.
    pub kind: u16,
    /// `e_machine`: 62 for x86-64.
    pub machine: u16,
    pub version: u32,
    pub entry: VirtualAddress,
    pub ph_offset: u64,
    pub sh_offset: u64,
    pub flags: u32,
    pub header_size: u16,
    pub ph_entry_size: u16,
    pub ph_count: u16,
    pub sh_entry_size: u16,
    pub sh_count: u16,
    /// Index of the section holding section names.
    pub sh_string_index: u16,
}

impl ElfHeader {
    /// Parse and check the identification bytes.
    ///
    /// Only the magic and the 64-bit class are required; machine and type
    /// are recorded but not enforced.
    ///
    /// # Errors
    /// [`LoadError::Truncated`], [`LoadError::BadMagic`] or
    /// [`LoadError::WrongClass`].
    pub fn parse(bytes: &[u8]) -> Result<Self, LoadError> {
        if bytes.len() < HEADER_LEN {
            return Err(LoadError::Truncated);
        }
        if bytes[..4] != ELF_MAGIC {
            return Err(LoadError::BadMagic);
        }
        if bytes[4] != ELFCLASS64 {
            return Err(LoadError::WrongClass);
        }

        Ok(Self {
            kind: le16(bytes, 16),
            machine: le16(bytes, 18),
            version: le32(bytes, 20),
            entry: VirtualAddress::new(le64(bytes, 24)),
            ph_offset: le64(bytes, 32),
            sh_offset: le64(bytes, 40),
            flags: le32(bytes, 48),
            header_size: le16(bytes, 52),
            ph_entry_size: le16(bytes, 54),
            ph_count: le16(bytes, 56),
            sh_entry_size: le16(bytes, 58),
            sh_count: le16(bytes, 60),
            sh_string_index: le16(bytes, 62),
        })
    }
}

/// `Elf64_Phdr.p_flags`: bit 0 = X, bit 1 = W, bit 2 = R.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct SegmentFlags {
    pub execute: bool,
    pub write: bool,
    pub read: bool,
    #[bits(29)]
    __: u32,
}

/// One program header (segment descriptor).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ProgramHeader {
    pub kind: u32,
    pub flags: SegmentFlags,
    /// Where the segment's bytes start in the file.
    pub offset: u64,
    pub vaddr: VirtualAddress,
    pub paddr: PhysicalAddress,
    /// Bytes present in the file; the rest up to `mem_size` is zero.
    pub file_size: u64,
    pub mem_size: u64,
    /// Never zero; a zero in the file reads as 1.
    pub align: u64,
}

impl ProgramHeader {
    fn read(s: &[u8]) -> Self {
        Self {
            kind: le32(s, 0),
            flags: SegmentFlags::from_bits(le32(s, 4)),
            offset: le64(s, 8),
            vaddr: VirtualAddress::new(le64(s, 16)),
            paddr: PhysicalAddress::new(le64(s, 24)),
            file_size: le64(s, 32),
            mem_size: le64(s, 40),
            align: le64(s, 48).max(1),
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_load(&self) -> bool {
        self.kind == PT_LOAD
    }

    /// End of the segment in memory, or `None` if it wraps.
    #[must_use]
    pub const fn vaddr_end(&self) -> Option<u64> {
        self.vaddr.as_u64().checked_add(self.mem_size)
    }

    /// The segment's bytes in `file`, or `None` if they are not all there.
    #[must_use]
    pub fn file_bytes<'a>(&self, file: &'a [u8]) -> Option<&'a [u8]> {
        let start = usize::try_from(self.offset).ok()?;
        let len = usize::try_from(self.file_size).ok()?;
        file.get(start..start.checked_add(len)?)
    }
}

/// One section header. Only what the loader reports is kept.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SectionHeader {
    /// Offset of the name in the section-name string table.
    pub name: u32,
    pub kind: u32,
    pub flags: u64,
    pub addr: VirtualAddress,
    pub offset: u64,
    pub size: u64,
}

impl SectionHeader {
    fn read(s: &[u8]) -> Self {
        Self {
            name: le32(s, 0),
            kind: le32(s, 4),
            flags: le64(s, 8),
            addr: VirtualAddress::new(le64(s, 16)),
            offset: le64(s, 24),
            size: le64(s, 32),
        }
    }
}

/// A table of fixed-size records inside the file.
#[derive(Copy, Clone, Default)]
struct Table<'a> {
    bytes: &'a [u8],
    offset: usize,
    count: usize,
    stride: usize,
}

impl<'a> Table<'a> {
    /// `None` if the table does not fit in `bytes` or its records are
    /// shorter than `min`.
    fn new(bytes: &'a [u8], offset: u64, count: u16, stride: u16, min: usize) -> Option<Self> {
        let count = usize::from(count);
        let stride = usize::from(stride);
        if count == 0 {
            return Some(Self::default());
        }
        if stride < min {
            return None;
        }
        let offset = usize::try_from(offset).ok()?;
        let end = offset.checked_add(count.checked_mul(stride)?)?;
        (end <= bytes.len()).then_some(Self {
            bytes,
            offset,
            count,
            stride,
        })
    }

    fn record(&self, i: usize) -> Option<&'a [u8]> {
        if i >= self.count {
            return None;
        }
        let at = self.offset + i * self.stride;
        self.bytes.get(at..at + self.stride)
    }
}

/// Iterator over the records of a header table.
pub struct Entries<'a, T> {
    table: Table<'a>,
    next: usize,
    read: fn(&[u8]) -> T,
}

pub type ProgramHeaders<'a> = Entries<'a, ProgramHeader>;
pub type SectionHeaders<'a> = Entries<'a, SectionHeader>;

impl<T> Iterator for Entries<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let record = self.table.record(self.next)?;
        self.next += 1;
        Some((self.read)(record))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let r = self.table.count.saturating_sub(self.next);
        (r, Some(r))
    }
}

impl<T> ExactSizeIterator for Entries<'_, T> {}
impl<T> FusedIterator for Entries<'_, T> {}

/// The program header table of `bytes`.
///
/// # Errors
/// [`LoadError::BadProgramHeader`] if the records are too short,
/// [`LoadError::Truncated`] if the table runs past the end of the file.
pub fn program_headers<'a>(bytes: &'a [u8], header: &ElfHeader) -> Result<ProgramHeaders<'a>, LoadError> {
    if header.ph_count > 0 && usize::from(header.ph_entry_size) < PROGRAM_HEADER_LEN {
        return Err(LoadError::BadProgramHeader);
    }
    let table = Table::new(
        bytes,
        header.ph_offset,
        header.ph_count,
        header.ph_entry_size,
        PROGRAM_HEADER_LEN,
    )
    .ok_or(LoadError::Truncated)?;
    Ok(Entries {
        table,
        next: 0,
        read: ProgramHeader::read,
    })
}

/// The section header table of `bytes`; empty if it is missing or malformed.
///
/// Sections play no part in loading, so a broken table is not an error.
#[must_use]
pub fn section_headers<'a>(bytes: &'a [u8], header: &ElfHeader) -> SectionHeaders<'a> {
    let table = Table::new(
        bytes,
        header.sh_offset,
        header.sh_count,
        header.sh_entry_size,
        SECTION_HEADER_LEN,
    )
    .unwrap_or_else(|| {
        log::warn!(
            "ignoring section header table ({} entries at {:#x})",
            header.sh_count,
            header.sh_offset
        );
        Table::default()
    });
    Entries {
        table,
        next: 0,
        read: SectionHeader::read,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes() -> Vec<u8> {
        let mut b = vec![0u8; HEADER_LEN];
        b[..4].copy_from_slice(&ELF_MAGIC);
        b[4] = ELFCLASS64;
        b[5] = 1;
        b[16..18].copy_from_slice(&2u16.to_le_bytes());
        b[18..20].copy_from_slice(&62u16.to_le_bytes());
        b[20..24].copy_from_slice(&1u32.to_le_bytes());
        b[24..32].copy_from_slice(&0x40_1000u64.to_le_bytes());
        b[52..54].copy_from_slice(&64u16.to_le_bytes());
        b[54..56].copy_from_slice(&56u16.to_le_bytes());
        b[58..60].copy_from_slice(&64u16.to_le_bytes());
        b
    }

    #[test]
    fn header_fields_are_little_endian() {
        let h = ElfHeader::parse(&header_bytes()).unwrap();
        assert_eq!(h.kind, 2);
        assert_eq!(h.machine, 62);
        assert_eq!(h.entry, VirtualAddress::new(0x40_1000));
        assert_eq!(h.ph_entry_size, 56);
        assert_eq!(h.ph_count, 0);
    }

    #[test]
    fn identification_is_checked_in_order() {
        assert_eq!(ElfHeader::parse(&[0x7F, b'E']), Err(LoadError::Truncated));

        let mut b = header_bytes();
        b[1] = b'Z';
        assert_eq!(ElfHeader::parse(&b), Err(LoadError::BadMagic));

        let mut b = header_bytes();
        b[4] = 1;
        assert_eq!(ElfHeader::parse(&b), Err(LoadError::WrongClass));
    }

    #[test]
    fn program_header_table_must_fit() {
        let mut b = header_bytes();
        b[32..40].copy_from_slice(&64u64.to_le_bytes());
        b[56..58].copy_from_slice(&1u16.to_le_bytes());
        let h = ElfHeader::parse(&b).unwrap();
        assert!(matches!(program_headers(&b, &h), Err(LoadError::Truncated)));

        b.resize(HEADER_LEN + PROGRAM_HEADER_LEN, 0);
        b[64..68].copy_from_slice(&PT_LOAD.to_le_bytes());
        b[68..72].copy_from_slice(&0b101u32.to_le_bytes());
        let ph: Vec<_> = program_headers(&b, &h).unwrap().collect();
        assert_eq!(ph.len(), 1);
        assert!(ph[0].is_load());
        assert!(ph[0].flags.execute() && ph[0].flags.read() && !ph[0].flags.write());
        assert_eq!(ph[0].align, 1);
    }

    #[test]
    fn short_program_header_records_are_rejected() {
        let mut b = header_bytes();
        b[54..56].copy_from_slice(&32u16.to_le_bytes());
        b[56..58].copy_from_slice(&1u16.to_le_bytes());
        let h = ElfHeader::parse(&b).unwrap();
        assert!(matches!(program_headers(&b, &h), Err(LoadError::BadProgramHeader)));
    }

    #[test]
    fn sections_are_read_when_present_and_skipped_when_broken() {
        let mut b = header_bytes();
        b[40..48].copy_from_slice(&64u64.to_le_bytes());
        b[60..62].copy_from_slice(&2u16.to_le_bytes());
        b.resize(HEADER_LEN + 2 * SECTION_HEADER_LEN, 0);
        let second = HEADER_LEN + SECTION_HEADER_LEN;
        b[second + 4..second + 8].copy_from_slice(&1u32.to_le_bytes());
        b[second + 16..second + 24].copy_from_slice(&0x40_1000u64.to_le_bytes());
        b[second + 32..second + 40].copy_from_slice(&0x20u64.to_le_bytes());

        let h = ElfHeader::parse(&b).unwrap();
        let sections: Vec<_> = section_headers(&b, &h).collect();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[1].kind, 1);
        assert_eq!(sections[1].addr, VirtualAddress::new(0x40_1000));
        assert_eq!(sections[1].size, 0x20);

        b.truncate(HEADER_LEN + SECTION_HEADER_LEN);
        assert_eq!(section_headers(&b, &h).len(), 0);
    }

    #[test]
    fn file_bytes_stay_inside_the_file() {
        let ph = ProgramHeader {
            kind: PT_LOAD,
            flags: SegmentFlags::new(),
            offset: 8,
            vaddr: VirtualAddress::new(0),
            paddr: PhysicalAddress::zero(),
            file_size: 4,
            mem_size: 4,
            align: 1,
        };
        assert_eq!(ph.file_bytes(&[0; 12]), Some(&[0u8; 4][..]));
        assert_eq!(ph.file_bytes(&[0; 11]), None);
    }
}
