//! Protection Keys for Supervisor.
//!
//! PKS is the isolation substrate of the single-address-space design:
//! every leaf PTE carries a 4-bit key, and the per-CPU PKRS MSR decides,
//! per key, whether supervisor accesses are allowed. Bring-up enables the
//! CR4 bit when CPUID reports the feature and clears PKRS so that all
//! sixteen keys start fully permissive.
//!
//! A CPU without PKS still boots: PTEs keep carrying key bits the hardware
//! ignores, and every operation here degrades to a no-op. Code that wants
//! to fence off a domain checks [`available`] first.
//!
//! The intended discipline for running untrusted code: tag its reachable
//! pages with a non-zero key, write a PKRS mask denying the kernel key,
//! jump, and restore the old mask on the way back.

use crate::cpuid;
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_registers::{Cr4, Ia32Pkrs, LoadRegister, StoreRegister};
use log::info;

static AVAILABLE: AtomicBool = AtomicBool::new(false);

/// Probe and enable PKS. Call once, before interrupts are enabled.
pub fn init() {
    if !cpuid::has_pks() {
        info!("PKS: Not supported");
        return;
    }

    unsafe {
        let cr4 = Cr4::load().with_pks(true);
        cr4.store();
        // All keys permit access until a domain tightens them.
        Ia32Pkrs::write(0);
    }
    AVAILABLE.store(true, Ordering::Release);
    info!("PKS: enabled, PKRS cleared");
}

/// Whether PKS was detected and enabled.
pub fn available() -> bool {
    AVAILABLE.load(Ordering::Acquire)
}

/// Read the current PKRS rights mask; 0 when PKS is absent.
pub fn rights_mask() -> u64 {
    if available() {
        unsafe { Ia32Pkrs::read() }
    } else {
        0
    }
}

/// Install a PKRS rights mask; no-op when PKS is absent.
///
/// # Safety
/// Denying a key that guards memory the current code path touches faults
/// on the next access. Callers pair this with a restore.
pub unsafe fn set_rights_mask(mask: u64) {
    if available() {
        unsafe { Ia32Pkrs::write(mask) }
    }
}
