//! Interrupt masking.
//!
//! On bare-metal x86-64 these functions execute `cli`/`sti` and read `RFLAGS`.
//! Everywhere else (host tests, tooling) there are no interrupts to mask and
//! they compile to no-ops, which keeps code built on [`IrqGuard`] testable.

/// `RFLAGS.IF`, the interrupt enable flag.
const RFLAGS_IF: u64 = 1 << 9;

/// Disables hardware interrupts (`cli`).
///
/// # Safety & Privilege
///
/// Must only be called in contexts where `cli` is permitted.
#[inline]
pub fn cli_stop_interrupts() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack, preserves_flags));
    }
}

/// Enables hardware interrupts (`sti`).
///
/// # Safety & Privilege
///
/// Must only be called in contexts where `sti` is permitted.
#[inline]
pub fn sti_enable_interrupts() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
    }
}

/// Whether maskable interrupts are currently enabled.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let r: u64;
        unsafe {
            core::arch::asm!("pushfq; pop {}", out(reg) r, options(nomem, preserves_flags));
        }
        r & RFLAGS_IF != 0
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = RFLAGS_IF;
        false
    }
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// Interrupts are re-enabled on drop **only** if they were enabled when the
/// guard was created, so guards nest.
///
/// ```no_run
/// use kernel_sync::IrqGuard;
///
/// {
///     let _g = IrqGuard::new(); // interrupts off
///     // mutate allocator state
/// }
/// // interrupt state restored
/// ```
pub struct IrqGuard {
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let were_enabled = interrupts_enabled();
        if were_enabled {
            cli_stop_interrupts();
        }
        Self { were_enabled }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            sti_enable_interrupts();
        }
    }
}
