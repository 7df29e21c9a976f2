//! Global Descriptor Table.
//!
//! Long mode ignores base and limit for code/data segments, but the CPU
//! still needs descriptors to source CS and the data selectors from. This
//! kernel never leaves ring 0 (user code runs supervisor, fenced by
//! protection keys), so three entries suffice: null, kernel code, kernel
//! data. No user descriptors, no TSS, no `ltr`.

use bitfield_struct::bitfield;

/// Selector for the kernel code descriptor (index 1).
pub const KERNEL_CS: u16 = 0x08;

/// Selector for the kernel data descriptor (index 2).
pub const KERNEL_DS: u16 = 0x10;

/// Shared bit layout of 8-byte code/data descriptors.
///
/// `limit`/`base` are don't-cares for the address calculation in long
/// mode; they are filled with the classic flat-segment values so the raw
/// encodings come out as the well-known constants (see the tests below).
#[bitfield(u64)]
struct DescriptorBits {
    limit_lo: u16,
    base_lo: u16,
    base_mid: u8,
    /// Type nibble: 0b1010 execute/read code, 0b0010 read/write data.
    #[bits(4)]
    typ: u8,
    /// 1 for code/data descriptors (0 is system).
    s: bool,
    #[bits(2)]
    dpl: u8,
    present: bool,
    #[bits(4)]
    limit_hi: u8,
    avl: bool,
    /// 64-bit code segment; must be 0 for data.
    long: bool,
    /// Default size; must be 0 when `long` is set.
    db: bool,
    /// 4 KiB limit granularity.
    granularity: bool,
    base_hi: u8,
}

/// One GDT entry.
#[repr(transparent)]
#[derive(Copy, Clone)]
struct Descriptor(u64);

impl Descriptor {
    const NULL: Self = Self(0);

    /// 64-bit ring-0 code: access byte 0x9A, flags 0xA, flat limit.
    const fn kernel_code() -> Self {
        Self(
            DescriptorBits::new()
                .with_limit_lo(0xFFFF)
                .with_limit_hi(0xF)
                .with_typ(0b1010)
                .with_s(true)
                .with_dpl(0)
                .with_present(true)
                .with_long(true)
                .with_db(false)
                .with_granularity(true)
                .into_bits(),
        )
    }

    /// Ring-0 data: access byte 0x92, flags 0xC, flat limit.
    const fn kernel_data() -> Self {
        Self(
            DescriptorBits::new()
                .with_limit_lo(0xFFFF)
                .with_limit_hi(0xF)
                .with_typ(0b0010)
                .with_s(true)
                .with_dpl(0)
                .with_present(true)
                .with_long(false)
                .with_db(true)
                .with_granularity(true)
                .into_bits(),
        )
    }
}

#[repr(C, align(16))]
struct Gdt {
    null: Descriptor,
    kernel_code: Descriptor,
    kernel_data: Descriptor,
}

static GDT: Gdt = Gdt {
    null: Descriptor::NULL,
    kernel_code: Descriptor::kernel_code(),
    kernel_data: Descriptor::kernel_data(),
};

// Freeze the classic encodings and the selector arithmetic.
const _: () = {
    assert!(size_of::<Gdt>() == 24);
    assert!(Descriptor::kernel_code().0 == 0x00AF_9A00_0000_FFFF);
    assert!(Descriptor::kernel_data().0 == 0x00CF_9200_0000_FFFF);
    assert!(KERNEL_CS == 1 << 3);
    assert!(KERNEL_DS == 2 << 3);
};

/// Operand of `lgdt`: limit plus linear base.
#[repr(C, packed)]
struct GdtPointer {
    limit: u16,
    base: u64,
}

/// Install the table and reload every segment register.
///
/// CS cannot be `mov`ed; the far-return sequence pushes the new selector
/// and a label and `retfq`s through it.
pub fn init() {
    let ptr = GdtPointer {
        limit: (size_of::<Gdt>() - 1) as u16,
        base: &raw const GDT as u64,
    };

    unsafe {
        core::arch::asm!(
            "lgdt [{ptr}]",

            // Data segments first.
            "mov ds, {ds:x}",
            "mov es, {ds:x}",
            "mov fs, {ds:x}",
            "mov gs, {ds:x}",
            "mov ss, {ds:x}",

            // Far return to flush CS.
            "push {cs}",
            "lea rax, [rip + 2f]",
            "push rax",
            "retfq",
            "2:",

            ptr = in(reg) &raw const ptr,
            ds = in(reg) KERNEL_DS,
            cs = in(reg) u64::from(KERNEL_CS),
            out("rax") _,
            options(nostack),
        );
    }
}
