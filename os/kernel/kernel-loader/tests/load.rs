use kernel_loader::elf::{HEADER_LEN, PROGRAM_HEADER_LEN, PT_LOAD};
use kernel_loader::{ControlTransfer, LoadError, RawImage};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_vmem::testing::{BumpFrames, FakePhysicalMemory, RecordingMmu};
use kernel_vmem::{AddressSpace, Hhdm, MapError, Vmm};

const BASE: u64 = 0x40_0000;

struct Segment<'a> {
    vaddr: u64,
    data: &'a [u8],
    mem_size: u64,
}

/// A minimal x86-64 executable with one `PT_LOAD` per segment.
fn elf(entry: u64, segments: &[Segment<'_>]) -> Vec<u8> {
    let table_end = HEADER_LEN + segments.len() * PROGRAM_HEADER_LEN;
    let mut b = vec![0u8; table_end];
    b[..4].copy_from_slice(b"\x7FELF");
    b[4] = 2;
    b[5] = 1;
    b[6] = 1;
    b[16..18].copy_from_slice(&2u16.to_le_bytes());
    b[18..20].copy_from_slice(&62u16.to_le_bytes());
    b[20..24].copy_from_slice(&1u32.to_le_bytes());
    b[24..32].copy_from_slice(&entry.to_le_bytes());
    b[32..40].copy_from_slice(&(HEADER_LEN as u64).to_le_bytes());
    b[52..54].copy_from_slice(&(HEADER_LEN as u16).to_le_bytes());
    b[54..56].copy_from_slice(&(PROGRAM_HEADER_LEN as u16).to_le_bytes());
    b[56..58].copy_from_slice(&(segments.len() as u16).to_le_bytes());

    for (i, s) in segments.iter().enumerate() {
        let offset = b.len() as u64;
        let at = HEADER_LEN + i * PROGRAM_HEADER_LEN;
        let ph = &mut b[at..at + PROGRAM_HEADER_LEN];
        ph[0..4].copy_from_slice(&PT_LOAD.to_le_bytes());
        ph[4..8].copy_from_slice(&0b101u32.to_le_bytes());
        ph[8..16].copy_from_slice(&offset.to_le_bytes());
        ph[16..24].copy_from_slice(&s.vaddr.to_le_bytes());
        ph[24..32].copy_from_slice(&s.vaddr.to_le_bytes());
        ph[32..40].copy_from_slice(&(s.data.len() as u64).to_le_bytes());
        ph[40..48].copy_from_slice(&s.mem_size.to_le_bytes());
        ph[48..56].copy_from_slice(&PAGE_SIZE.to_le_bytes());
        b.extend_from_slice(s.data);
    }
    b
}

struct Machine {
    mem: FakePhysicalMemory,
    vmm: Vmm<Hhdm, RecordingMmu>,
    kernel: AddressSpace,
}

impl Machine {
    /// Frame 1 is the kernel root; frames from 2 up are free.
    fn new() -> Self {
        let mem = FakePhysicalMemory::new(64);
        let vmm = Vmm::new(mem.hhdm(), RecordingMmu::default());
        let kernel = unsafe { AddressSpace::kernel(PhysicalAddress::new(PAGE_SIZE)) };
        Self { mem, vmm, kernel }
    }

    fn space(&self, frames: &mut BumpFrames) -> AddressSpace {
        self.vmm.create_address_space(frames, &self.kernel).unwrap()
    }

    /// `len` bytes at `va` in `space`, page by page.
    fn read(&self, space: &AddressSpace, va: u64, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        let mut va = VirtualAddress::new(va);
        while out.len() < len {
            let pa = self.vmm.translate(space, va).expect("page is mapped");
            let n = (len - out.len()).min((PAGE_SIZE - pa.page_offset()) as usize);
            out.extend_from_slice(self.mem.read(pa, n));
            va = va + n as u64;
        }
        out
    }
}

#[derive(Default)]
struct RecordingTransfer {
    entered: Vec<(PhysicalAddress, VirtualAddress, VirtualAddress)>,
}

impl ControlTransfer for RecordingTransfer {
    unsafe fn enter(&mut self, space: &AddressSpace, entry: VirtualAddress, stack_top: VirtualAddress) -> i64 {
        self.entered.push((space.root(), entry, stack_top));
        42
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 + 1).collect()
}

#[test]
fn bss_tail_is_zero_after_file_bytes() {
    let m = Machine::new();
    let mut frames = BumpFrames::new(2, 16);
    let mut space = m.space(&mut frames);
    let data = pattern(4100);
    let file = elf(BASE, &[Segment {
        vaddr: BASE,
        data: &data,
        mem_size: 8192,
    }]);

    let image = RawImage::new(&file)
        .validate()
        .unwrap()
        .map_into(&mut frames, &m.vmm, &mut space)
        .unwrap();

    assert_eq!(image.pages(), 2);
    assert_eq!(image.segments(), 1);
    let loaded = m.read(&space, BASE, 8192);
    assert_eq!(&loaded[..4100], &data[..]);
    assert!(loaded[4100..].iter().all(|&b| b == 0));
}

#[test]
fn unaligned_segment_keeps_its_page_offset() {
    let m = Machine::new();
    let mut frames = BumpFrames::new(2, 16);
    let mut space = m.space(&mut frames);
    let data = pattern(32);
    let vaddr = BASE + PAGE_SIZE - 16;
    let file = elf(vaddr, &[Segment {
        vaddr,
        data: &data,
        mem_size: 32,
    }]);

    let image = RawImage::new(&file)
        .validate()
        .unwrap()
        .map_into(&mut frames, &m.vmm, &mut space)
        .unwrap();

    assert_eq!(image.pages(), 2, "the segment straddles a page boundary");
    assert_eq!(m.read(&space, vaddr, 32), data);
    assert!(m.read(&space, BASE, (PAGE_SIZE - 16) as usize).iter().all(|&b| b == 0));
}

#[test]
fn segments_sharing_a_page_reuse_it() {
    let m = Machine::new();
    let mut frames = BumpFrames::new(2, 16);
    let mut space = m.space(&mut frames);
    let code = pattern(64);
    let data = [0xAA; 16];
    let file = elf(BASE, &[
        Segment {
            vaddr: BASE,
            data: &code,
            mem_size: 64,
        },
        Segment {
            vaddr: BASE + 0x800,
            data: &data,
            mem_size: 16,
        },
    ]);

    let image = RawImage::new(&file)
        .validate()
        .unwrap()
        .map_into(&mut frames, &m.vmm, &mut space)
        .unwrap();

    assert_eq!(image.pages(), 1);
    assert_eq!(image.segments(), 2);
    assert_eq!(m.read(&space, BASE, 64), code);
    assert_eq!(m.read(&space, BASE + 0x800, 16), data);
}

#[test]
fn bad_magic_allocates_nothing() {
    let m = Machine::new();
    let mut frames = BumpFrames::new(2, 16);
    let _space = m.space(&mut frames);
    let before = frames.allocated();

    let mut file = elf(BASE, &[]);
    file[0] = 0x7E;

    assert!(matches!(RawImage::new(&file).validate(), Err(LoadError::BadMagic)));
    assert_eq!(frames.allocated(), before);
}

#[test]
fn rejects_wrong_class_and_truncated_files() {
    let mut file = elf(BASE, &[]);
    file[4] = 1;
    assert!(matches!(RawImage::new(&file).validate(), Err(LoadError::WrongClass)));

    assert!(matches!(
        RawImage::new(&[0x7F, b'E', b'L', b'F', 2]).validate(),
        Err(LoadError::Truncated)
    ));

    let mut file = elf(BASE, &[Segment {
        vaddr: BASE,
        data: &[1; 8],
        mem_size: 8,
    }]);
    file.truncate(HEADER_LEN + 8);
    assert!(matches!(RawImage::new(&file).validate(), Err(LoadError::Truncated)));
}

#[test]
fn rejects_inconsistent_segments() {
    let more_file_than_memory = elf(BASE, &[Segment {
        vaddr: BASE,
        data: &[1; 32],
        mem_size: 16,
    }]);
    assert!(matches!(
        RawImage::new(&more_file_than_memory).validate(),
        Err(LoadError::BadProgramHeader)
    ));

    let kernel_half = elf(BASE, &[Segment {
        vaddr: 0xffff_8000_0000_0000,
        data: &[1; 8],
        mem_size: 8,
    }]);
    assert!(matches!(
        RawImage::new(&kernel_half).validate(),
        Err(LoadError::BadProgramHeader)
    ));

    let mut past_the_file = elf(BASE, &[Segment {
        vaddr: BASE,
        data: &[1; 8],
        mem_size: 8,
    }]);
    past_the_file.truncate(past_the_file.len() - 1);
    assert!(matches!(
        RawImage::new(&past_the_file).validate(),
        Err(LoadError::BadProgramHeader)
    ));
}

#[test]
fn running_out_of_frames_fails_the_load() {
    let m = Machine::new();
    let mut frames = BumpFrames::new(2, 1);
    let mut space = m.space(&mut frames);
    let file = elf(BASE, &[Segment {
        vaddr: BASE,
        data: &[1; 8],
        mem_size: 8,
    }]);

    let result = RawImage::new(&file)
        .validate()
        .unwrap()
        .map_into(&mut frames, &m.vmm, &mut space);

    assert!(matches!(result, Err(LoadError::AllocationFailed)));
    assert_eq!(m.vmm.destroy_address_space(&mut frames, space), 1);
}

#[test]
fn failed_mapping_returns_the_page_frame() {
    let m = Machine::new();
    // Root, one data frame and two of the three tables the walk needs.
    let mut frames = BumpFrames::new(2, 4);
    let mut space = m.space(&mut frames);
    let file = elf(BASE, &[Segment {
        vaddr: BASE,
        data: &[1; 8],
        mem_size: 8,
    }]);

    let result = RawImage::new(&file)
        .validate()
        .unwrap()
        .map_into(&mut frames, &m.vmm, &mut space);

    assert!(matches!(
        result,
        Err(LoadError::MappingFailed(MapError::OutOfFrames))
    ));
    assert_eq!(frames.freed(), [PhysicalAddress::new(3 * PAGE_SIZE)]);

    // The half-built walk is reclaimed with the space.
    assert_eq!(m.vmm.destroy_address_space(&mut frames, space), 3);
}

#[test]
fn execute_flushes_then_enters_the_target_space() {
    let m = Machine::new();
    let mut frames = BumpFrames::new(2, 16);
    let mut space = m.space(&mut frames);
    let entry = BASE + 0x10;
    let file = elf(entry, &[Segment {
        vaddr: BASE,
        data: &pattern(0x40),
        mem_size: 0x40,
    }]);

    let image = RawImage::new(&file)
        .validate()
        .unwrap()
        .map_into(&mut frames, &m.vmm, &mut space)
        .unwrap();
    assert_eq!(image.entry(), VirtualAddress::new(entry));

    let mut cpu = RecordingTransfer::default();
    let flushes = m.vmm.mmu().flushes();
    let stack_top = VirtualAddress::new(0xffff_9000_0000_1000);
    let done = unsafe { image.execute(&m.vmm, &space, stack_top, &mut cpu) };

    assert_eq!(m.vmm.mmu().flushes(), flushes + 1);
    assert_eq!(cpu.entered, [(space.root(), VirtualAddress::new(entry), stack_top)]);
    assert_eq!(done.status, 42);
    assert_eq!(done.entry, VirtualAddress::new(entry));
}

#[test]
fn mapping_only_borrows_the_file() {
    let m = Machine::new();
    let mut frames = BumpFrames::new(2, 16);
    let mut space = m.space(&mut frames);
    let data = pattern(16);
    let file = elf(BASE, &[Segment {
        vaddr: BASE,
        data: &data,
        mem_size: 16,
    }]);

    let validated = RawImage::new(&file).validate().unwrap();
    let mapped = validated.map_into(&mut frames, &m.vmm, &mut space).unwrap();

    // The validated image and the file are still usable after mapping.
    assert_eq!(validated.segments().count(), 1);
    assert_eq!(mapped.entry(), validated.entry());
    assert_eq!(m.read(&space, BASE, 16), data);
    drop(validated);
    assert_eq!(file.len(), HEADER_LEN + PROGRAM_HEADER_LEN + 16);
}
