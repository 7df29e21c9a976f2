//! Local APIC (xAPIC mode, MMIO).
//!
//! The LAPIC register block lives at a fixed physical address (reported by
//! the `IA32_APIC_BASE` MSR, 0xFEE00000 on everything this kernel runs
//! on) and is accessed through the higher-half direct map. The kernel's
//! own page tables map that frame uncached; see `vmem`.
//!
//! Only three things are needed from it: software-enable via the spurious
//! vector register, the APIC ID (for IOAPIC redirection targets), and the
//! end-of-interrupt register.

use crate::interrupts::SPURIOUS_VECTOR;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_registers::Msr;
use log::info;

/// Default xAPIC MMIO base, used when the MSR reports nothing sensible.
pub const LAPIC_DEFAULT_BASE: u64 = 0xFEE0_0000;

const IA32_APIC_BASE: Msr = Msr::new(0x1B);
/// IA32_APIC_BASE bit 11: APIC global enable.
const APIC_GLOBAL_ENABLE: u64 = 1 << 11;

const REG_ID: usize = 0x20;
const REG_EOI: usize = 0xB0;
const REG_SPURIOUS: usize = 0xF0;
const REG_TPR: usize = 0x80;

/// Spurious vector register bit 8: APIC software enable.
const SVR_ENABLE: u8 = 1;

/// Virtual address of the register block; zero until [`init`].
static LAPIC_MMIO: AtomicU64 = AtomicU64::new(0);

/// Physical base of the LAPIC register frame.
pub fn physical_base() -> u64 {
    let base = unsafe { IA32_APIC_BASE.read() } & 0xF_FFFF_F000;
    if base == 0 { LAPIC_DEFAULT_BASE } else { base }
}

#[inline]
fn reg(offset: usize) -> *mut u32 {
    let base = LAPIC_MMIO.load(Ordering::Relaxed);
    debug_assert!(base != 0, "LAPIC used before init");
    (base as usize + offset) as *mut u32
}

#[inline]
fn read(offset: usize) -> u32 {
    unsafe { reg(offset).read_volatile() }
}

#[inline]
fn write(offset: usize, value: u32) {
    unsafe { reg(offset).write_volatile(value) }
}

/// Globally enable the LAPIC and software-enable it through the SVR.
///
/// `hhdm_offset` is the direct-map offset the register frame is reachable
/// through; bring-up calls this before the kernel's own tables exist,
/// relying on the bootloader's identical mapping.
pub fn init(hhdm_offset: u64) {
    let phys = physical_base();
    LAPIC_MMIO.store(hhdm_offset + phys, Ordering::Relaxed);

    unsafe {
        IA32_APIC_BASE.write(IA32_APIC_BASE.read() | APIC_GLOBAL_ENABLE);
    }

    // Software enable with the spurious vector in the low byte, then
    // accept all priorities.
    write(
        REG_SPURIOUS,
        (u32::from(SVR_ENABLE) << 8) | u32::from(SPURIOUS_VECTOR),
    );
    write(REG_TPR, 0);

    info!("LAPIC: enabled at {phys:#x}, id {}", id());
}

/// This CPU's APIC ID.
pub fn id() -> u8 {
    (read(REG_ID) >> 24) as u8
}

/// Signal end-of-interrupt. Must be the last step of every IRQ handler
/// path (and never sent for the spurious vector).
pub fn eoi() {
    write(REG_EOI, 0);
}
