//! The machine behind the syscall layer.
//!
//! [`Platform`] holds no state itself: the boot volume lives in its own
//! lock, taken per operation. A loaded image can therefore issue syscalls
//! while the `exec` that started it is still on the stack.

use crate::ramdisk::Ramdisk;
use core::hint::spin_loop;
use kernel_loader::ControlTransfer;
use kernel_memory_addresses::VirtualAddress;
use kernel_qemu::qemu_trace;
use kernel_sync::{SpinMutex, SyncOnceCell};
use kernel_syscall::fat12::SECTOR_SIZE;
use kernel_syscall::{Console, DeviceError, Fat12Volume, FileError, FileStore, SectorDevice, Timer};
use kernel_vmem::{AddressSpace, Mmu, X86Mmu};

type Volume = Fat12Volume<Ramdisk<'static>>;

static VOLUME: SyncOnceCell<SpinMutex<Volume>> = SyncOnceCell::new();

/// Busy-wait iterations per millisecond. There is no calibrated timer.
const SPINS_PER_MS: u64 = 100_000;

/// Make `disk` the boot volume. Later calls keep the first one.
pub fn mount(disk: Ramdisk<'static>) {
    let sectors = disk.sectors();
    if VOLUME.set(SpinMutex::new(Fat12Volume::new(disk))).is_err() {
        log::warn!("boot volume already mounted");
        return;
    }
    log::info!("mounted FAT12 ramdisk, {sectors} sectors");
}

fn with_volume<R, E>(f: impl FnOnce(&mut Volume) -> Result<R, E>, missing: E) -> Result<R, E> {
    match VOLUME.get() {
        Some(volume) => f(&mut volume.lock_irq()),
        None => Err(missing),
    }
}

#[derive(Debug, Default)]
pub struct Platform;

impl Console for Platform {
    fn write_text(&mut self, text: &str) {
        qemu_trace!("{text}");
    }
}

impl FileStore for Platform {
    fn file_size(&mut self, name: &str) -> Result<u32, FileError> {
        with_volume(|v| v.file_size(name), FileError::NotFound)
    }

    fn read_file(&mut self, name: &str, buf: &mut [u8]) -> Result<usize, FileError> {
        with_volume(|v| v.read_file(name, buf), FileError::NotFound)
    }

    fn write_file(&mut self, name: &str, data: &[u8]) -> Result<(), FileError> {
        with_volume(|v| v.write_file(name, data), FileError::ReadOnly)
    }
}

impl SectorDevice for Platform {
    fn read_sector(&mut self, lba: u32, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), DeviceError> {
        with_volume(|v| v.read_sector(lba, buf), DeviceError)
    }
}

impl Timer for Platform {
    fn sleep_ms(&mut self, ms: u64) {
        for _ in 0..ms.saturating_mul(SPINS_PER_MS) {
            spin_loop();
        }
    }
}

impl ControlTransfer for Platform {
    /// Switch to `space`, call `entry` on the stack ending at `stack_top`
    /// and switch back.
    ///
    /// The image runs at CPL0 and returns with `ret`; its `rax` is the
    /// status.
    unsafe fn enter(&mut self, space: &AddressSpace, entry: VirtualAddress, stack_top: VirtualAddress) -> i64 {
        let mmu = X86Mmu;
        let previous = mmu.current_root();

        // SAFETY: a derived space shares the kernel half, so this code, the
        // kernel stack and the image stack stay mapped.
        unsafe { mmu.load_root(space.root()) };
        let status = unsafe { call_on_stack(entry.as_u64(), stack_top.as_u64()) };
        unsafe { mmu.load_root(previous) };
        status
    }
}

/// Call `entry` with `rsp` set to `top`, then return to the current stack.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
unsafe fn call_on_stack(entry: u64, top: u64) -> i64 {
    let status: i64;
    unsafe {
        core::arch::asm!(
            "mov r12, rsp",
            "mov rsp, {top}",
            "call {entry}",
            "mov rsp, r12",
            top = in(reg) top,
            entry = in(reg) entry,
            out("r12") _,
            lateout("rax") status,
            clobber_abi("sysv64"),
        );
    }
    status
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
unsafe fn call_on_stack(entry: u64, top: u64) -> i64 {
    log::error!("cannot enter {entry:#x} (stack {top:#x}) off bare metal");
    kernel_syscall::SyscallError::LoadFailed.code()
}
