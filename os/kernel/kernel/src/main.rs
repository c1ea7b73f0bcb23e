//! # Kernel Entry Point
//!
//! Boot order:
//!
//! 1. [`_start_kernel`] moves onto the boot stack.
//! 2. The QEMU logger is installed.
//! 3. The UEFI memory map is decoded and the kernel memory context comes up
//!    (VMM from CR3, bitmap PMM with its self test, heap).
//! 4. The ramdisk is mounted as the FAT12 boot volume.
//! 5. `INIT.ELF` is loaded and run if the volume has one.
//!
//! Loaded images reach the kernel through [`syscall_handler`].
//!
//! Off bare metal the crate builds to an empty host binary so the workspace
//! can be checked and tested with a plain `cargo test`.

#![cfg_attr(target_os = "none", no_std, no_main)]
#![cfg_attr(not(target_os = "none"), allow(dead_code, unused_imports))]
#![allow(unsafe_code)]

extern crate alloc;

mod platform;
mod ramdisk;

use crate::platform::Platform;
use crate::ramdisk::Ramdisk;
use kernel_alloc::{KernelMemory, init_kernel_memory, kernel_memory};
use kernel_info::boot::{EfiMemoryMap, KernelBootInfo};
use kernel_info::memory::{KERNEL_STACK_SIZE, MemoryLayout};
use kernel_qemu::{QemuLogger, qemu_trace};
use kernel_sync::SpinMutex;
use kernel_syscall::{SyscallError, Syscalls};
use log::LevelFilter;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: kernel_alloc::KernelAllocator = kernel_alloc::KernelAllocator::new();

static LOGGER: QemuLogger = QemuLogger::new(LevelFilter::Debug);

/// Program started once memory and the boot volume are up.
const INIT_PROGRAM: &str = "INIT.ELF";

/// 16-byte aligned stack
#[repr(align(16))]
struct Aligned<const N: usize>([u8; N]);

#[cfg_attr(target_os = "none", unsafe(link_section = ".bss.boot"))]
#[unsafe(no_mangle)]
static mut BOOT_STACK: Aligned<KERNEL_STACK_SIZE> = Aligned([0; KERNEL_STACK_SIZE]);

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    qemu_trace!("kernel panic: {info}\n");
    halt()
}

/// The kernel entry point
///
/// # UEFI Interaction
/// The UEFI loader will jump here after `ExitBootServices`.
///
/// # ABI
/// The ABI is defined as `win64` since the kernel is called from a UEFI
/// (PE/COFF) application. This passes the `boot_info` pointer as `RCX`
/// (as opposed to `RDI` for the SysV ABI).
///
/// # Naked function & Stack
/// Naked so the stack can be replaced before any Rust code runs; the
/// compiler must not assume anything about the firmware's stack.
#[cfg(target_os = "none")]
#[unsafe(no_mangle)]
#[unsafe(naked)]
pub extern "win64" fn _start_kernel(_boot_info: *const KernelBootInfo) {
    core::arch::naked_asm!(
        "cli",
        // save RCX (boot_info per Win64)
        "mov r12, rcx",

        "lea rax, [rip + {stack_sym}]",
        "add rax, {stack_size}",
        "and rax, -16",
        // Reserve 32-byte shadow space
        "sub rax, 32",
        "mov rsp, rax",
        // Emulate a CALL by pushing a dummy return address (so RSP % 16 == 8 at entry)
        "push 0",
        "xor rbp, rbp",

        // boot_info into the SysV argument register
        "mov rdi, r12",
        "jmp {rust_entry}",
        stack_sym = sym BOOT_STACK,
        stack_size = const KERNEL_STACK_SIZE,
        rust_entry = sym kernel_entry,
    );
}

/// Kernel entry running on the boot stack.
#[cfg(target_os = "none")]
#[unsafe(no_mangle)]
extern "C" fn kernel_entry(boot_info: *const KernelBootInfo) -> ! {
    qemu_trace!("Kernel reporting to QEMU!\n");
    let bi = unsafe { &*boot_info };
    kernel_main(bi)
}

fn kernel_main(bi: &KernelBootInfo) -> ! {
    if LOGGER.install().is_err() {
        qemu_trace!("logger already installed\n");
    }

    let layout = MemoryLayout::DEFAULT;
    // SAFETY: the loader hands over a readable map and leaves CR3 on the
    // kernel tables with the direct map at `HHDM_BASE`.
    let memory = match unsafe { init_kernel_memory(EfiMemoryMap::from_info(&bi.mmap), &layout) } {
        Ok(memory) => memory,
        Err(e) => {
            log::error!("memory initialization failed: {e}");
            halt()
        }
    };
    log_memory(&memory.lock_irq());

    // SAFETY: the ramdisk is loader data the kernel never reuses.
    match unsafe { Ramdisk::from_info(&bi.ramdisk, layout.hhdm_offset) } {
        Some(disk) => platform::mount(disk),
        None => log::warn!("no ramdisk, file syscalls will fail"),
    }

    run(memory, INIT_PROGRAM);
    log::info!("nothing left to run");
    halt()
}

fn log_memory(memory: &KernelMemory) {
    let pmm = memory.pmm();
    let heap = memory.heap_stats();
    log::info!(
        "{} of {} frames in use, {} KiB free; heap {} bytes, {} free",
        pmm.used_pages(),
        pmm.total_pages(),
        pmm.free_memory() / 1024,
        heap.total,
        heap.free
    );
}

fn run(memory: &SpinMutex<KernelMemory>, name: &str) {
    let mut platform = Platform;
    match Syscalls::new(memory, &mut platform).exec(name) {
        Ok(()) => log::info!("{name} finished"),
        Err(SyscallError::FileNotFound) => log::info!("no {name} on the boot volume"),
        Err(e) => log::error!("{name}: {e}"),
    }
}

/// Entry point for the syscall trap stub.
///
/// Returns a non-negative result or a negative [`SyscallError`] code.
///
/// # Safety
/// See [`Syscalls::dispatch`]: pointer arguments come straight from the
/// calling image and must be valid in the active address space.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn syscall_handler(nr: u64, a1: u64, a2: u64, a3: u64) -> i64 {
    let Some(memory) = kernel_memory() else {
        return SyscallError::InvalidArgument.code();
    };
    let mut platform = Platform;
    unsafe { Syscalls::new(memory, &mut platform).dispatch(nr, [a1, a2, a3]) }
}

fn halt() -> ! {
    loop {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        unsafe {
            core::arch::asm!("hlt", options(nomem, nostack, preserves_flags));
        }
        core::hint::spin_loop();
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
