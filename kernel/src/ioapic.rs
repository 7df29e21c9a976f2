//! IOAPIC programming.
//!
//! The IOAPIC is reached through an indirect register pair at its MMIO
//! base: write the register index to IOREGSEL (+0x00), then read or write
//! the value at IOWIN (+0x10). Each external interrupt line has a 64-bit
//! redirection entry split across two registers.
//!
//! The base address is the architectural default 0xFEC00000; parsing the
//! ACPI MADT for relocated or multiple IOAPICs is future work.

use core::sync::atomic::{AtomicU64, Ordering};
use log::info;

/// Default IOAPIC MMIO base.
pub const IOAPIC_DEFAULT_BASE: u64 = 0xFEC0_0000;

const IOREGSEL: usize = 0x00;
const IOWIN: usize = 0x10;

/// Redirection table entries start at register 0x10, two per IRQ.
const REG_REDIRECTION_BASE: u32 = 0x10;

static IOAPIC_MMIO: AtomicU64 = AtomicU64::new(0);

/// Record the direct-map address of the IOAPIC. Interrupt lines are
/// programmed individually later, as drivers come up.
pub fn init(hhdm_offset: u64) {
    IOAPIC_MMIO.store(hhdm_offset + IOAPIC_DEFAULT_BASE, Ordering::Relaxed);
    info!("IOAPIC: ready at {IOAPIC_DEFAULT_BASE:#x}");
}

fn write(register: u32, value: u32) {
    let base = IOAPIC_MMIO.load(Ordering::Relaxed) as usize;
    debug_assert!(base != 0, "IOAPIC used before init");
    unsafe {
        ((base + IOREGSEL) as *mut u32).write_volatile(register);
        ((base + IOWIN) as *mut u32).write_volatile(value);
    }
}

/// Route `irq` to `vector` on the CPU with APIC ID `apic_id`.
///
/// The entry is written fixed-delivery, physical destination, active
/// high, edge triggered, unmasked; the high half (destination) goes first
/// so the line is never briefly unmasked at a stale target.
pub fn redirect(irq: u8, vector: u8, apic_id: u8) {
    let low = REG_REDIRECTION_BASE + 2 * u32::from(irq);
    let high = low + 1;

    // Destination APIC ID in bits 56..63 of the entry.
    write(high, u32::from(apic_id) << 24);
    // Vector in bits 0..7; every other field zero means fixed delivery,
    // physical destination, active high, edge, unmasked.
    write(low, u32::from(vector));

    info!("IOAPIC: irq {irq} -> vector {vector:#x} (apic {apic_id})");
}
