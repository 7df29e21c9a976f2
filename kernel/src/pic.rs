//! Legacy 8259 PIC: remapped, then masked.
//!
//! The IOAPIC is the active interrupt controller, but the two 8259s still
//! power up mapped over the CPU exception vectors and will deliver
//! spurious interrupts there unless dealt with. The standard ICW sequence
//! moves them to 0x20..0x2F, then every line is masked; they are never
//! touched again.

use crate::ports::{io_wait, outb};

const PIC1_CMD: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_CMD: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

const ICW1_INIT_WITH_ICW4: u8 = 0x11;
const ICW4_8086_MODE: u8 = 0x01;

/// Primary PIC vector base after remapping.
const PIC1_OFFSET: u8 = 0x20;
/// Secondary PIC vector base after remapping.
const PIC2_OFFSET: u8 = 0x28;

/// Remap both PICs away from the exception range and mask all 16 lines.
pub fn remap_and_mask() {
    unsafe {
        // ICW1: begin initialization, ICW4 follows.
        outb(PIC1_CMD, ICW1_INIT_WITH_ICW4);
        io_wait();
        outb(PIC2_CMD, ICW1_INIT_WITH_ICW4);
        io_wait();

        // ICW2: vector offsets.
        outb(PIC1_DATA, PIC1_OFFSET);
        io_wait();
        outb(PIC2_DATA, PIC2_OFFSET);
        io_wait();

        // ICW3: secondary on IRQ2 of the primary.
        outb(PIC1_DATA, 0b0000_0100);
        io_wait();
        outb(PIC2_DATA, 2);
        io_wait();

        // ICW4: 8086 mode.
        outb(PIC1_DATA, ICW4_8086_MODE);
        io_wait();
        outb(PIC2_DATA, ICW4_8086_MODE);
        io_wait();

        // Mask everything; the IOAPIC owns device interrupts from here.
        outb(PIC1_DATA, 0xFF);
        outb(PIC2_DATA, 0xFF);
    }
    log::debug!("PIC remapped to {PIC1_OFFSET:#x}..{:#x} and masked", PIC2_OFFSET + 8);
}
