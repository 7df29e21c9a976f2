//! The kernel's address space.
//!
//! Bring-up hands the CPU a page-table tree the kernel owns instead of the
//! bootloader's: the full higher-half direct map rebuilt region by region
//! (2 MiB leaves where alignment allows), uncached windows for the LAPIC
//! and IOAPIC register frames, and the kernel image at its linked virtual
//! base. Everything is tagged protection key 0, the kernel's own key.
//!
//! After the switch this module is the mapping service for the rest of
//! the kernel: the ELF loader installs program pages through
//! [`map_page`], which also keeps the TLB coherent.

use crate::{apic, boot, ioapic, mem};
use kernel_vmem::{
    AddressSpace, EntryFlags, HUGE_PAGE_SIZE, MapError, PAGE_SIZE, PhysAddr, ProtectionKey,
    VirtAddr, align_up, invalidate_page,
};
use kernel_registers::{Cr3, LoadRegister};
use limine::memory_map::{Entry, EntryType};
use log::{debug, info};

use core::sync::atomic::{AtomicU64, Ordering};

/// Physical address of the kernel PML4; zero until [`init`] installs it.
static ROOT: AtomicU64 = AtomicU64::new(0);

/// Fallback kernel image size when the memory map reports no
/// executable-and-modules regions.
const KERNEL_SIZE_FALLBACK: u64 = 2 * 1024 * 1024;

fn space() -> AddressSpace<'static, mem::HhdmMapper> {
    let root = ROOT.load(Ordering::Relaxed);
    debug_assert!(root != 0, "vmem used before init");
    AddressSpace::new(mem::mapper(), PhysAddr::new(root))
}

/// Build the kernel page tables and load CR3.
///
/// Runs on the bootloader's tables; every frame the build touches is
/// reached through the direct map, which the new tree reproduces at the
/// same offset, so pointers (including the current stack) stay valid
/// across the switch.
pub fn init() {
    let root = mem::alloc_frame().expect("no frame for the kernel PML4");
    let space = AddressSpace::new(mem::mapper(), root);

    let entries = boot::memory_map();
    for entry in entries {
        map_hhdm_region(&space, entry);
    }

    // LAPIC and IOAPIC register frames: uncached, in the direct map like
    // everything else physical.
    for mmio in [apic::physical_base(), ioapic::IOAPIC_DEFAULT_BASE] {
        map_mmio_frame(&space, PhysAddr::new(mmio));
    }

    map_kernel_image(&space, entries);

    ROOT.store(root.as_u64(), Ordering::Relaxed);
    unsafe {
        space.activate();
        debug_assert_eq!(Cr3::load().pml4_phys(), root.as_u64());
    }
    info!("VMM: kernel page tables installed (pml4 at {root})");
}

/// Reproduce the direct map for one memory-map region: 2 MiB leaves
/// while base and remaining length allow, 4 KiB (with NX) otherwise.
fn map_hhdm_region(space: &AddressSpace<'_, mem::HhdmMapper>, entry: &Entry) {
    let hhdm = mem::hhdm_offset();
    let mut pa = entry.base & !(PAGE_SIZE - 1);
    let end = align_up(entry.base + entry.length, PAGE_SIZE);

    while pa < end {
        let remaining = end - pa;
        if pa % HUGE_PAGE_SIZE == 0 && remaining >= HUGE_PAGE_SIZE {
            mem::with_pmm(|pmm| {
                space.map_huge_page(
                    pmm,
                    VirtAddr::new(hhdm + pa),
                    PhysAddr::new(pa),
                    EntryFlags::WRITABLE,
                    ProtectionKey::KERNEL,
                )
            })
            .expect("direct map: out of frames");
            pa += HUGE_PAGE_SIZE;
        } else {
            mem::with_pmm(|pmm| {
                space.map_page(
                    pmm,
                    VirtAddr::new(hhdm + pa),
                    PhysAddr::new(pa),
                    EntryFlags::WRITABLE | EntryFlags::NO_EXECUTE,
                    ProtectionKey::KERNEL,
                )
            })
            .expect("direct map: out of frames");
            pa += PAGE_SIZE;
        }
    }
}

fn map_mmio_frame(space: &AddressSpace<'_, mem::HhdmMapper>, pa: PhysAddr) {
    let va = mem::phys_to_virt(pa);
    mem::with_pmm(|pmm| {
        space.map_page(
            pmm,
            va,
            pa,
            EntryFlags::WRITABLE | EntryFlags::CACHE_DISABLE | EntryFlags::NO_EXECUTE,
            ProtectionKey::KERNEL,
        )
    })
    .expect("mmio map: out of frames");
}

/// Map the kernel image at its linked virtual base. The size is the sum
/// of the executable-and-modules regions (the map does not say which one
/// is the image proper), with a 2 MiB floor.
fn map_kernel_image(space: &AddressSpace<'_, mem::HhdmMapper>, entries: &[&Entry]) {
    let exec = boot::executable_address();
    let virt_base = exec.virtual_base();
    let phys_base = exec.physical_base();

    let summed: u64 = entries
        .iter()
        .filter(|e| e.entry_type == EntryType::EXECUTABLE_AND_MODULES)
        .map(|e| e.length)
        .sum();
    let size = align_up(summed.max(KERNEL_SIZE_FALLBACK), PAGE_SIZE);
    debug!("kernel image: {size:#x} bytes at {virt_base:#x} (phys {phys_base:#x})");

    let mut offset = 0;
    while offset < size {
        mem::with_pmm(|pmm| {
            space.map_page(
                pmm,
                VirtAddr::new(virt_base + offset),
                PhysAddr::new(phys_base + offset),
                EntryFlags::WRITABLE,
                ProtectionKey::KERNEL,
            )
        })
        .expect("kernel image map: out of frames");
        offset += PAGE_SIZE;
    }
}

/// Map one page in the live kernel address space and flush its TLB entry.
pub fn map_page(
    va: VirtAddr,
    pa: PhysAddr,
    flags: EntryFlags,
    key: ProtectionKey,
) -> Result<(), MapError> {
    let space = space();
    mem::with_pmm(|pmm| space.map_page(pmm, va, pa, flags, key))?;
    unsafe { invalidate_page(va) };
    Ok(())
}

/// Translate a virtual address through the live tree.
pub fn query(va: VirtAddr) -> Option<PhysAddr> {
    space().query(va)
}
