//! Bring-up sequence.
//!
//! Leaves first: console, descriptor tables, the protection-key probe and
//! the interrupt controllers come up on the bootloader's memory view;
//! then the PMM takes over physical memory, the VMM replaces the page
//! tables, the heap comes alive over both, and the kernel table is
//! published. Interrupts stay disabled until every piece is in place.

use crate::{apic, boot, framebuffer, gdt, idt, ioapic, keyboard, ktable, mem, pic, pks, serial,
            tsc, vmem};
use log::info;

pub fn start() -> ! {
    serial::init();
    crate::logger::init();
    info!("Kernel Started");

    // A bootloader that does not speak our revision halts here, before
    // anything depends on its responses.
    boot::check_base_revision();

    gdt::init();
    info!("GDT Initialized");

    idt::init();
    info!("IDT Initialized");

    pks::init();

    pic::remap_and_mask();
    let hhdm = boot::hhdm_offset();
    apic::init(hhdm);
    ioapic::init(hhdm);

    mem::init(hhdm, boot::memory_map());
    if boot::base_revision_supported() {
        info!("Base Revision Supported");
    }

    vmem::init();

    // First allocation proves the heap path end to end.
    let probe = alloc::boxed::Box::new(0xC0FF_EEu64);
    assert_eq!(*probe, 0xC0FF_EE);
    drop(probe);
    info!("heap: segregated lists online");

    tsc::init();
    framebuffer::init();
    keyboard::init();
    ktable::init();

    kernel_sync::irq::enable_interrupts();
    info!("bring-up complete, interrupts on");

    #[cfg(feature = "selftest")]
    {
        crate::selftest::run()
    }
    #[cfg(not(feature = "selftest"))]
    {
        crate::shell::run()
    }
}
