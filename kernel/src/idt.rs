//! Interrupt Descriptor Table.
//!
//! 256 16-byte gate descriptors and a small builder for filling them in.
//! Every populated gate in this kernel is an interrupt gate (type 0xE,
//! IF cleared on entry) targeting [`KERNEL_CS`](crate::gdt::KERNEL_CS);
//! vectors that are never installed stay non-present and any stray
//! delivery surfaces as a fault through the exception handlers.

use crate::gdt::KERNEL_CS;
use bitfield_struct::bitfield;

/// Gate attribute word: IST index, gate type, DPL, present.
#[bitfield(u16)]
struct GateAttributes {
    #[bits(3)]
    ist: u8,
    #[bits(5)]
    __zero: u8,
    /// 0xE interrupt gate, 0xF trap gate.
    #[bits(4)]
    typ: u8,
    s: bool,
    #[bits(2)]
    dpl: u8,
    present: bool,
}

/// One 16-byte IDT gate.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct IdtEntry {
    offset_lo: u16,
    selector: u16,
    attributes: u16,
    offset_mid: u16,
    offset_hi: u32,
    reserved: u32,
}

impl IdtEntry {
    const MISSING: Self = Self {
        offset_lo: 0,
        selector: 0,
        attributes: 0,
        offset_mid: 0,
        offset_hi: 0,
        reserved: 0,
    };

    /// Point this gate at `handler` as a present ring-0 interrupt gate.
    fn set_handler(&mut self, handler: unsafe extern "C" fn()) {
        let addr = handler as usize as u64;
        self.offset_lo = (addr & 0xFFFF) as u16;
        self.offset_mid = ((addr >> 16) & 0xFFFF) as u16;
        self.offset_hi = (addr >> 32) as u32;
        self.selector = KERNEL_CS;
        self.attributes = GateAttributes::new()
            .with_typ(0xE)
            .with_dpl(0)
            .with_present(true)
            .into_bits();
    }
}

const _: () = assert!(size_of::<IdtEntry>() == 16);

#[repr(C, align(16))]
pub struct Idt {
    entries: [IdtEntry; 256],
}

impl Idt {
    pub const fn new() -> Self {
        Self {
            entries: [IdtEntry::MISSING; 256],
        }
    }

    pub fn set_handler(&mut self, vector: u8, handler: unsafe extern "C" fn()) {
        self.entries[vector as usize].set_handler(handler);
    }

    /// Load this table into the IDTR.
    ///
    /// # Safety
    /// `self` must live for the rest of the kernel's life, and every
    /// present gate must reference a real stub.
    pub unsafe fn load(&'static self) {
        let ptr = IdtPointer {
            limit: (size_of::<Self>() - 1) as u16,
            base: core::ptr::from_ref(self) as u64,
        };
        unsafe {
            core::arch::asm!(
                "lidt [{}]",
                in(reg) &raw const ptr,
                options(readonly, nostack, preserves_flags),
            );
        }
    }
}

#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u64,
}

static mut IDT: Idt = Idt::new();

/// Build the kernel IDT (CPU exceptions plus the device vectors) and load
/// it. Call once, with interrupts disabled.
pub fn init() {
    #[allow(static_mut_refs)]
    unsafe {
        crate::interrupts::install(&mut IDT);
        IDT.load();
    }
}
