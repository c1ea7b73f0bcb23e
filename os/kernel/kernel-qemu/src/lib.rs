//! # QEMU Debug Console Support
//!
//! Log output for a kernel running under QEMU. Bytes written to I/O port
//! `0x402` show up on the host when QEMU is started with
//! `-debugcon stdio` (or `-debugcon file:debug.log`).
//!
//! ```text
//! log::info!(..) ──► QemuLogger ──► qemu_trace! ──► QemuSink ──► out 0x402
//! ```
//!
//! ## Features
//! * `enabled` (default): port writes are compiled in. Without it, the
//!   logger and [`qemu_trace!`] still type-check but write nothing, which is
//!   also what host builds get.
//!
//! ## Usage
//! ```rust,no_run
//! use kernel_qemu::QemuLogger;
//! use log::LevelFilter;
//!
//! static LOGGER: QemuLogger = QemuLogger::new(LevelFilter::Debug);
//! LOGGER.install().expect("logger installed twice");
//! log::info!("frame allocator ready");
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use logger::{QemuLogger, write_record};

#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt::{self, Write};

    /// QEMU `isa-debugcon` I/O port.
    pub const QEMU_DEBUG_PORT: u16 = 0x402;

    /// Write a single byte to the debug console.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn dbg_putc(c: u8) {
        #[cfg(all(feature = "enabled", target_arch = "x86_64", target_os = "none"))]
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") QEMU_DEBUG_PORT,
                in("al") c,
                options(nomem, nostack, preserves_flags)
            );
        }
        #[cfg(not(all(feature = "enabled", target_arch = "x86_64", target_os = "none")))]
        let _ = c;
    }

    /// `fmt::Write` adapter over the debug console.
    pub struct QemuSink;

    impl Write for QemuSink {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            s.bytes().for_each(dbg_putc);
            Ok(())
        }
    }

    #[inline]
    pub fn qemu_write(args: fmt::Arguments) {
        // Best effort; the sink itself never fails.
        let _ = fmt::write(&mut QemuSink, args);
    }
}

/// Formats straight to the QEMU debug console, bypassing `log`.
///
/// Useful before the logger is installed.
#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        $crate::qemu_fmt::qemu_write(core::format_args!($($arg)*));
    }};
}
