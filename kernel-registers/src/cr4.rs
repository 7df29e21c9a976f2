use crate::{LoadRegister, StoreRegister};
use bitfield_struct::bitfield;

/// CR4, the feature-enable control register.
///
/// Only the bits this kernel reads or writes are named; everything else is
/// kept readable so a load-modify-store round trip never clobbers state the
/// firmware or bootloader set up.
#[bitfield(u64)]
pub struct Cr4 {
    /// Bits 0..=4: VME, PVI, TSD, DE, PSE.
    #[bits(5, access = RO)]
    pub legacy: u8,

    /// Bit 5: PAE, Physical Address Extension. Set in long mode.
    #[bits(access = RO)]
    pub pae: bool,

    /// Bit 6: MCE, Machine-Check Enable.
    #[bits(access = RO)]
    pub mce: bool,

    /// Bit 7: PGE, Page Global Enable. Required for `global` PTE bits to
    /// survive CR3 reloads.
    pub pge: bool,

    /// Bits 8..=19: PCE through OSXSAVE; owned by earlier boot stages.
    #[bits(12, access = RO)]
    pub mid: u16,

    /// Bit 20: SMEP, Supervisor Mode Execution Prevention.
    pub smep: bool,

    /// Bit 21: SMAP, Supervisor Mode Access Prevention.
    pub smap: bool,

    /// Bit 22: PKE, user-mode protection keys (PKRU). Not used here; the
    /// kernel runs supervisor-only.
    pub pke: bool,

    /// Bit 23: CET, Control-flow Enforcement.
    #[bits(access = RO)]
    pub cet: bool,

    /// Bit 24: PKS, Protection Keys for Supervisor. Gates the PKRS MSR and
    /// makes the CPU honor the key bits in supervisor-mode translations.
    pub pks: bool,

    /// Bits 25..=63: reserved.
    #[bits(39, access = RO)]
    reserved: u64,
}

#[cfg(target_arch = "x86_64")]
impl LoadRegister for Cr4 {
    unsafe fn load() -> Self {
        let raw: u64;
        unsafe {
            core::arch::asm!("mov {}, cr4", out(reg) raw, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(raw)
    }
}

#[cfg(target_arch = "x86_64")]
impl StoreRegister for Cr4 {
    /// # Safety
    /// Setting a bit the CPU does not support raises `#GP`. Gate feature
    /// enables (such as [`pks`](Self::pks)) behind the matching CPUID probe.
    unsafe fn store(self) {
        unsafe {
            core::arch::asm!("mov cr4, {}", in(reg) self.into_bits(), options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pks_is_bit_24() {
        let cr4 = Cr4::new().with_pks(true);
        assert_eq!(cr4.into_bits(), 1 << 24);
    }

    #[test]
    fn round_trip_preserves_foreign_bits() {
        // A plausible boot-time CR4: PAE | PGE | OSFXSR | OSXMMEXCPT.
        let boot = (1 << 5) | (1 << 7) | (1 << 9) | (1 << 10);
        let cr4 = Cr4::from_bits(boot).with_pks(true);
        assert_eq!(cr4.into_bits(), boot | (1 << 24));
    }
}
