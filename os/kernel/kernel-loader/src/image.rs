//! The load pipeline as a chain of owned states.
//!
//! ```text
//! RawImage ──validate──► ValidatedImage ──map_into──► MappedImage
//!     │                        │                           │ begin_execution (TLB flush)
//!     └──────── Err(LoadError) ┘                           ▼
//!            (nothing executed)                Executing ──transfer──► Done
//! ```
//!
//! Only a [`ValidatedImage`] can be mapped and only a [`MappedImage`] can be
//! executed. The file bytes are borrowed and never freed here; the caller
//! owns them and releases them after the memory lock is dropped.

use crate::elf::{self, ElfHeader, ProgramHeader, SectionHeaders};
use crate::{ControlTransfer, LoadError};
use kernel_info::memory::LOWER_HALF_END;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, align_down, align_up};
use kernel_vmem::{AddressSpace, FRAME_BYTES, FrameAlloc, Mmu, PageTableEntry, PhysMapper, Vmm};

/// File bytes that have not been looked at yet.
pub struct RawImage<'a> {
    bytes: &'a [u8],
}

impl<'a> RawImage<'a> {
    #[must_use]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Check the header and every loadable segment.
    ///
    /// A loadable segment must carry no more file bytes than memory bytes,
    /// its file range must lie inside the image, and its memory range must
    /// fit in the lower half so it can never touch shared kernel tables.
    ///
    /// # Errors
    /// [`LoadError::Truncated`], [`LoadError::BadMagic`],
    /// [`LoadError::WrongClass`] or [`LoadError::BadProgramHeader`].
    pub fn validate(self) -> Result<ValidatedImage<'a>, LoadError> {
        let header = ElfHeader::parse(self.bytes)?;
        log::debug!(
            "ELF type {:#x}, machine {:#x}, version {}, entry {}, flags {:#x}",
            header.kind,
            header.machine,
            header.version,
            header.entry,
            header.flags
        );
        log::debug!(
            "{} program headers at {:#x} ({} bytes each), {} section headers at {:#x}, names in #{}",
            header.ph_count,
            header.ph_offset,
            header.ph_entry_size,
            header.sh_count,
            header.sh_offset,
            header.sh_string_index
        );

        for ph in elf::program_headers(self.bytes, &header)?.filter(ProgramHeader::is_load) {
            if !segment_is_sound(&ph, self.bytes) {
                log::warn!(
                    "rejecting segment at {} (file {:#x}+{:#x}, memory {:#x})",
                    ph.vaddr,
                    ph.offset,
                    ph.file_size,
                    ph.mem_size
                );
                return Err(LoadError::BadProgramHeader);
            }
        }

        let image = ValidatedImage {
            bytes: self.bytes,
            header,
        };
        for (i, sh) in image.sections().enumerate() {
            log::debug!(
                "section {i}: type {:#x}, addr {}, offset {:#x}, size {:#x}",
                sh.kind,
                sh.addr,
                sh.offset,
                sh.size
            );
        }
        Ok(image)
    }
}

fn segment_is_sound(ph: &ProgramHeader, file: &[u8]) -> bool {
    ph.file_size <= ph.mem_size
        && ph.file_bytes(file).is_some()
        && ph.vaddr_end().is_some_and(|end| end <= LOWER_HALF_END)
}

/// An image whose header and segments have been checked.
pub struct ValidatedImage<'a> {
    bytes: &'a [u8],
    header: ElfHeader,
}

impl ValidatedImage<'_> {
    #[must_use]
    pub const fn header(&self) -> &ElfHeader {
        &self.header
    }

    #[must_use]
    pub const fn entry(&self) -> VirtualAddress {
        self.header.entry
    }

    /// All program headers.
    pub fn program_headers(&self) -> impl Iterator<Item = ProgramHeader> + '_ {
        // Bounds were checked by `validate`, the table is always there.
        elf::program_headers(self.bytes, &self.header)
            .into_iter()
            .flatten()
    }

    /// The `PT_LOAD` headers only.
    pub fn segments(&self) -> impl Iterator<Item = ProgramHeader> + '_ {
        self.program_headers().filter(ProgramHeader::is_load)
    }

    #[must_use]
    pub fn sections(&self) -> SectionHeaders<'_> {
        elf::section_headers(self.bytes, &self.header)
    }

    /// Back every loadable segment with fresh zeroed frames in `space` and
    /// copy the file bytes in.
    ///
    /// Pages are mapped user-writable. A page already present in `space`
    /// (two segments sharing a page) is reused as is. On failure the frames
    /// and tables created so far stay in `space`; destroying the space
    /// reclaims them. Nothing is allocated from or returned to the heap.
    ///
    /// # Errors
    /// [`LoadError::AllocationFailed`] when no frame is left for a page,
    /// [`LoadError::MappingFailed`] when a page cannot be mapped and
    /// [`LoadError::TranslationFailed`] when a mapped page does not resolve.
    pub fn map_into<A, M, U>(
        &self,
        alloc: &mut A,
        vmm: &Vmm<M, U>,
        space: &mut AddressSpace,
    ) -> Result<MappedImage, LoadError>
    where
        A: FrameAlloc,
        M: PhysMapper,
        U: Mmu,
    {
        let mut pages = 0;
        let mut segments = 0;
        for ph in self.segments() {
            pages += map_segment(alloc, vmm, space, &ph)?;
            let bytes = ph.file_bytes(self.bytes).ok_or(LoadError::BadProgramHeader)?;
            populate(vmm, space, ph.vaddr, bytes)?;
            segments += 1;
        }

        log::info!(
            "mapped {segments} segments into {} ({pages} pages), entry {}",
            space.root(),
            self.header.entry
        );
        Ok(MappedImage {
            entry: self.header.entry,
            segments,
            pages,
        })
    }
}

/// Returns the number of frames newly mapped.
fn map_segment<A, M, U>(
    alloc: &mut A,
    vmm: &Vmm<M, U>,
    space: &mut AddressSpace,
    ph: &ProgramHeader,
) -> Result<u64, LoadError>
where
    A: FrameAlloc,
    M: PhysMapper,
    U: Mmu,
{
    let start = align_down(ph.vaddr.as_u64(), PAGE_SIZE);
    let end = ph
        .vaddr_end()
        .and_then(|end| align_up(end, PAGE_SIZE))
        .ok_or(LoadError::BadProgramHeader)?;

    let mut fresh = 0;
    for page in (start..end).step_by(FRAME_BYTES) {
        let va = VirtualAddress::new(page);
        if vmm.translate(space, va).is_some() {
            continue;
        }

        let pa = alloc.alloc_frame().ok_or(LoadError::AllocationFailed)?;
        if let Err(e) = vmm.map_page(alloc, space, va, pa, PageTableEntry::user_rw()) {
            log::warn!("mapping {va} -> {pa} failed: {e}");
            alloc.free_frame(pa);
            return Err(LoadError::MappingFailed(e));
        }

        // SAFETY: `pa` was just allocated and is only reachable through the
        // new leaf, which nothing runs on yet.
        unsafe { vmm.mapper().frame_mut(pa) }.fill(0);
        fresh += 1;
    }
    Ok(fresh)
}

/// Copy `src` to `va` in `space`, one page at a time.
#[allow(clippy::cast_possible_truncation)]
fn populate<M: PhysMapper, U: Mmu>(
    vmm: &Vmm<M, U>,
    space: &AddressSpace,
    mut va: VirtualAddress,
    mut src: &[u8],
) -> Result<(), LoadError> {
    while !src.is_empty() {
        let pa = vmm.translate(space, va).ok_or(LoadError::TranslationFailed(va))?;
        let offset = pa.page_offset() as usize;
        let len = src.len().min(FRAME_BYTES - offset);

        // SAFETY: the frame belongs to `space` and was mapped by this load.
        let frame = unsafe { vmm.mapper().frame_mut(pa) };
        frame[offset..offset + len].copy_from_slice(&src[..len]);

        src = &src[len..];
        va = va + len as u64;
    }
    Ok(())
}

/// An image resident in its target space; no longer tied to the file bytes.
#[derive(Debug)]
pub struct MappedImage {
    entry: VirtualAddress,
    segments: usize,
    pages: u64,
}

impl MappedImage {
    #[must_use]
    pub const fn entry(&self) -> VirtualAddress {
        self.entry
    }

    /// Loadable segments that were mapped.
    #[must_use]
    pub const fn segments(&self) -> usize {
        self.segments
    }

    /// Frames mapped for the image.
    #[must_use]
    pub const fn pages(&self) -> u64 {
        self.pages
    }

    /// Flush the TLB so no stale translation survives into the image.
    ///
    /// The returned state no longer needs the VMM, so whatever lock guards
    /// it can be released before control is transferred.
    pub fn begin_execution<M: PhysMapper, U: Mmu>(self, vmm: &Vmm<M, U>) -> Executing {
        vmm.flush_tlb();
        Executing { entry: self.entry }
    }

    /// [`begin_execution`](Self::begin_execution) followed by
    /// [`Executing::transfer`].
    ///
    /// # Safety
    /// See [`Executing::transfer`].
    pub unsafe fn execute<M, U, T>(
        self,
        vmm: &Vmm<M, U>,
        space: &AddressSpace,
        stack_top: VirtualAddress,
        transfer: &mut T,
    ) -> Done
    where
        M: PhysMapper,
        U: Mmu,
        T: ControlTransfer + ?Sized,
    {
        unsafe { self.begin_execution(vmm).transfer(space, stack_top, transfer) }
    }
}

/// An image about to run: mapped, with the TLB flushed.
#[derive(Debug)]
#[must_use]
pub struct Executing {
    entry: VirtualAddress,
}

impl Executing {
    #[must_use]
    pub const fn entry(&self) -> VirtualAddress {
        self.entry
    }

    /// Hand control to the entry point; returns once the image returns
    /// through `transfer`.
    ///
    /// # Safety
    /// `space` must be the space this image was mapped into, and the image
    /// must be trusted to run in the mode `transfer` enters it in.
    /// `stack_top` must be the 16-byte aligned end of a writable stack that
    /// is mapped in `space` and outlives the call.
    pub unsafe fn transfer<T: ControlTransfer + ?Sized>(
        self,
        space: &AddressSpace,
        stack_top: VirtualAddress,
        transfer: &mut T,
    ) -> Done {
        log::info!("entering image at {} in {}, stack top {stack_top}", self.entry, space.root());
        let status = unsafe { transfer.enter(space, self.entry, stack_top) };
        log::debug!("image at {} returned {status:#x}", self.entry);
        Done {
            entry: self.entry,
            status,
        }
    }
}

/// An image that ran and came back.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Done {
    pub entry: VirtualAddress,
    /// Whatever the image left in its return register.
    pub status: i64,
}
