//! PS/2 keyboard: IRQ 1 producer, polled consumer.
//!
//! The IRQ handler reads scancodes from port 0x60, translates the make
//! codes of a plain US layout to ASCII and pushes them into a ring
//! buffer; [`poll`] drains it from the main thread. The ring is the one
//! structure shared across the interrupt boundary in this kernel, and the
//! SPSC discipline of [`ByteRing`] is exactly its contract. A full buffer
//! drops the new byte and says so once in the log.

use crate::ports::inb;
use crate::{apic, interrupts, ioapic};
use kernel_sync::ByteRing;

const STATUS_PORT: u16 = 0x64;
const DATA_PORT: u16 = 0x60;

/// Status bit 0: output buffer has a byte for us.
const OUTPUT_FULL: u8 = 1;

static BUFFER: ByteRing<256> = ByteRing::new();

/// Scancode set 1 make codes to ASCII, US layout, letters uppercased.
/// Index is the scancode; zero means "no mapping".
const SCANCODE_MAP: [u8; 64] = [
    0, 0x1B, b'1', b'2', b'3', b'4', b'5', b'6', // 0x00
    b'7', b'8', b'9', b'0', b'-', b'=', 0x08, b'\t', // 0x08
    b'Q', b'W', b'E', b'R', b'T', b'Y', b'U', b'I', // 0x10
    b'O', b'P', b'[', b']', b'\n', 0, b'A', b'S', // 0x18
    b'D', b'F', b'G', b'H', b'J', b'K', b'L', b';', // 0x20
    b'\'', b'`', 0, b'\\', b'Z', b'X', b'C', b'V', // 0x28
    b'B', b'N', b'M', b',', b'.', b'/', 0, b'*', // 0x30
    0, b' ', 0, 0, 0, 0, 0, 0, // 0x38
];

/// Route IRQ 1 to this CPU. The PS/2 controller needs no further setup
/// under QEMU/SeaBIOS; translation to set 1 is already on.
pub fn init() {
    ioapic::redirect(1, interrupts::KEYBOARD_VECTOR, apic::id());
}

/// IRQ-context half: drain the controller into the ring.
pub fn handle_irq() {
    unsafe {
        while inb(STATUS_PORT) & OUTPUT_FULL != 0 {
            let scancode = inb(DATA_PORT);
            // Key releases (bit 7) and anything unmapped are dropped.
            if scancode & 0x80 != 0 {
                continue;
            }
            let ascii = SCANCODE_MAP.get(scancode as usize).copied().unwrap_or(0);
            if ascii != 0 && !BUFFER.push(ascii) {
                log::warn!("keyboard: buffer full, dropping {ascii:#x}");
            }
        }
    }
}

/// Next buffered key, or 0 when none is pending. Never blocks.
pub fn poll() -> u8 {
    BUFFER.pop().unwrap_or(0)
}
