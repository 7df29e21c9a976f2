//! Exception and interrupt dispatch.
//!
//! Every installed vector funnels through the same path: a tiny naked stub
//! normalizes the stack (vectors without a CPU error code push a zero, then
//! every stub pushes its vector number), a common stub saves the general
//! purpose registers, and one C-ABI dispatcher receives a pointer to the
//! resulting [`InterruptFrame`].
//!
//! CPU exceptions log the frame and halt; this kernel has no one to kill
//! and nothing to unwind. The two device vectors (keyboard and the LAPIC
//! spurious vector) are routed to their drivers, with the end-of-interrupt
//! write as the final step of the IRQ path. A spurious interrupt gets no
//! EOI, per the LAPIC protocol.

use crate::idt::Idt;
use crate::{apic, keyboard};
use kernel_vmem::VirtAddr;

/// IOAPIC-routed keyboard interrupt (IRQ 1).
pub const KEYBOARD_VECTOR: u8 = 0x21;

/// LAPIC spurious vector; also written to the SVR during enable.
pub const SPURIOUS_VECTOR: u8 = 0xFF;

/// Register state captured by the stubs, in push order.
///
/// The layout is shared between the assembly below and the dispatcher and
/// must match the pushes in `isr_common` exactly: general purpose
/// registers first (r15 at the lowest address), then the vector and error
/// code pushed by the per-vector stub, then the frame the CPU pushed.
#[repr(C)]
#[derive(Debug)]
pub struct InterruptFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    /// Vector number pushed by the stub.
    pub vector: u64,
    /// CPU error code, or 0 for vectors that do not push one.
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

const _: () = assert!(core::mem::size_of::<InterruptFrame>() == 22 * 8);

/// Stub for a vector where the CPU pushes no error code: push a synthetic
/// zero so the frame layout is uniform.
macro_rules! isr_stub {
    ($name:ident, $vector:expr) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() {
            core::arch::naked_asm!(
                "push 0",
                "push {vector}",
                "jmp {common}",
                vector = const $vector,
                common = sym isr_common,
            )
        }
    };
    ($name:ident, $vector:expr, error_code) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() {
            core::arch::naked_asm!(
                "push {vector}",
                "jmp {common}",
                vector = const $vector,
                common = sym isr_common,
            )
        }
    };
}

// The 32 architectural exception vectors. The error-code set is fixed by
// the architecture: 8, 10..=14, 17, 21, 29, 30.
isr_stub!(isr_0, 0);
isr_stub!(isr_1, 1);
isr_stub!(isr_2, 2);
isr_stub!(isr_3, 3);
isr_stub!(isr_4, 4);
isr_stub!(isr_5, 5);
isr_stub!(isr_6, 6);
isr_stub!(isr_7, 7);
isr_stub!(isr_8, 8, error_code);
isr_stub!(isr_9, 9);
isr_stub!(isr_10, 10, error_code);
isr_stub!(isr_11, 11, error_code);
isr_stub!(isr_12, 12, error_code);
isr_stub!(isr_13, 13, error_code);
isr_stub!(isr_14, 14, error_code);
isr_stub!(isr_15, 15);
isr_stub!(isr_16, 16);
isr_stub!(isr_17, 17, error_code);
isr_stub!(isr_18, 18);
isr_stub!(isr_19, 19);
isr_stub!(isr_20, 20);
isr_stub!(isr_21, 21, error_code);
isr_stub!(isr_22, 22);
isr_stub!(isr_23, 23);
isr_stub!(isr_24, 24);
isr_stub!(isr_25, 25);
isr_stub!(isr_26, 26);
isr_stub!(isr_27, 27);
isr_stub!(isr_28, 28);
isr_stub!(isr_29, 29, error_code);
isr_stub!(isr_30, 30, error_code);
isr_stub!(isr_31, 31);

// Device vectors share the same frame machinery.
isr_stub!(isr_keyboard, 0x21);
isr_stub!(isr_spurious, 0xFF);

const EXCEPTION_STUBS: [unsafe extern "C" fn(); 32] = [
    isr_0, isr_1, isr_2, isr_3, isr_4, isr_5, isr_6, isr_7, isr_8, isr_9, isr_10, isr_11, isr_12,
    isr_13, isr_14, isr_15, isr_16, isr_17, isr_18, isr_19, isr_20, isr_21, isr_22, isr_23, isr_24,
    isr_25, isr_26, isr_27, isr_28, isr_29, isr_30, isr_31,
];

/// Save all GPRs around the dispatcher call, then return from the
/// interrupt. Stack alignment works out without adjustment: the CPU
/// aligns to 16 before pushing, and 5-or-6 CPU words plus the stub's
/// 2-or-1 plus 15 GPRs always lands back on a 16-byte boundary.
#[unsafe(naked)]
unsafe extern "C" fn isr_common() {
    core::arch::naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "cld",
        "mov rdi, rsp",
        "call {dispatch}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        // Drop vector + error code.
        "add rsp, 16",
        "iretq",
        dispatch = sym isr_dispatch,
    )
}

extern "C" fn isr_dispatch(frame: &mut InterruptFrame) {
    match frame.vector {
        v if v == u64::from(KEYBOARD_VECTOR) => {
            keyboard::handle_irq();
            // EOI is the last act of the IRQ path; skipping it mutes the
            // line for good.
            apic::eoi();
        }
        v if v == u64::from(SPURIOUS_VECTOR) => {}
        v if v < 32 => handle_exception(frame),
        v => {
            log::warn!("interrupt on unconfigured vector {v}");
            apic::eoi();
        }
    }
}

const EXCEPTION_NAMES: [&str; 32] = [
    "#DE divide error",
    "#DB debug",
    "NMI",
    "#BP breakpoint",
    "#OF overflow",
    "#BR bound range",
    "#UD invalid opcode",
    "#NM device not available",
    "#DF double fault",
    "coprocessor segment overrun",
    "#TS invalid TSS",
    "#NP segment not present",
    "#SS stack fault",
    "#GP general protection",
    "#PF page fault",
    "reserved (15)",
    "#MF x87 floating point",
    "#AC alignment check",
    "#MC machine check",
    "#XM SIMD floating point",
    "#VE virtualization",
    "#CP control protection",
    "reserved (22)",
    "reserved (23)",
    "reserved (24)",
    "reserved (25)",
    "reserved (26)",
    "reserved (27)",
    "#HV hypervisor injection",
    "#VC VMM communication",
    "#SX security",
    "reserved (31)",
];

fn handle_exception(frame: &InterruptFrame) -> ! {
    let vector = frame.vector as usize;
    log::error!(
        "CPU exception {vector} ({}), error code {:#x}",
        EXCEPTION_NAMES[vector],
        frame.error_code
    );
    log::error!(
        "  rip={:#018x} cs={:#06x} rflags={:#010x} rsp={:#018x}",
        frame.rip,
        frame.cs,
        frame.rflags,
        frame.rsp
    );
    log::error!(
        "  rax={:#018x} rbx={:#018x} rcx={:#018x} rdx={:#018x}",
        frame.rax,
        frame.rbx,
        frame.rcx,
        frame.rdx
    );
    log::error!(
        "  rsi={:#018x} rdi={:#018x} rbp={:#018x}",
        frame.rsi,
        frame.rdi,
        frame.rbp
    );
    if vector == 14 {
        log::error!("  faulting address (cr2) = {}", read_cr2());
    }
    crate::halt_loop()
}

fn read_cr2() -> VirtAddr {
    let cr2: u64;
    unsafe {
        core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
    }
    VirtAddr::new(cr2)
}

/// Populate `idt` with every vector this kernel handles.
pub fn install(idt: &mut Idt) {
    for (vector, stub) in EXCEPTION_STUBS.iter().enumerate() {
        idt.set_handler(vector as u8, *stub);
    }
    idt.set_handler(KEYBOARD_VECTOR, isr_keyboard);
    idt.set_handler(SPURIOUS_VECTOR, isr_spurious);
}
