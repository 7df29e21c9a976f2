//! Local interrupt masking.
//!
//! Critical sections that share state with interrupt handlers have to mask
//! interrupts for their duration, or a handler arriving mid-section will
//! deadlock on the same lock. [`IrqGuard`] snapshots the `IF` flag, executes
//! `cli`, and restores the previous state on drop, so nested guards compose.
//!
//! All of this is x86_64 `cli`/`sti`/`pushfq` and requires CPL 0.

/// RFLAGS bit 9, the interrupt-enable flag.
const IF_BIT: u64 = 1 << 9;

/// Disable maskable interrupts on this CPU.
#[inline]
pub fn disable_interrupts() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack, preserves_flags));
    }
}

/// Enable maskable interrupts on this CPU.
#[inline]
pub fn enable_interrupts() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
    }
}

/// Read the current `RFLAGS` value.
#[inline]
#[must_use]
pub fn rflags() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        let r: u64;
        unsafe {
            core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags));
        }
        r
    }
    #[cfg(not(target_arch = "x86_64"))]
    0
}

/// Whether maskable interrupts are currently enabled.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    rflags() & IF_BIT != 0
}

/// RAII section with interrupts masked.
///
/// Disables interrupts on creation if they were enabled and restores the
/// prior state on drop. Dropping in reverse creation order keeps nesting
/// correct.
pub struct IrqGuard {
    were_enabled: bool,
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let were_enabled = interrupts_enabled();
        if were_enabled {
            disable_interrupts();
        }
        Self { were_enabled }
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            enable_interrupts();
        }
    }
}
