//! Physical memory bookkeeping: the HHDM mapper and the global PMM.
//!
//! Everything physical goes through here: the [`HhdmMapper`] turns
//! physical addresses into pointers via the bootloader-established
//! higher-half direct map, and the bitmap frame allocator from
//! `kernel-pmm` is wrapped in a spinlock as the one authority over RAM.

use kernel_pmm::{BitmapFrameAllocator, MemoryRegion, RegionKind};
use kernel_sync::{SpinLock, SyncOnceCell};
use kernel_vmem::{PhysAddr, PhysMapper, VirtAddr};
use limine::memory_map::{Entry, EntryType};
use log::info;

/// Physical-to-virtual translation through the higher-half direct map.
///
/// The offset comes from the bootloader and never changes; the kernel's
/// own page tables reproduce the same direct map before taking over, so
/// the translation stays valid across the CR3 switch.
pub struct HhdmMapper {
    offset: u64,
}

impl HhdmMapper {
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    pub const fn offset(&self) -> u64 {
        self.offset
    }
}

impl PhysMapper for HhdmMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T {
        unsafe { &mut *((self.offset + pa.as_u64()) as *mut T) }
    }
}

static MAPPER: SyncOnceCell<HhdmMapper> = SyncOnceCell::new();
static PMM: SyncOnceCell<SpinLock<BitmapFrameAllocator>> = SyncOnceCell::new();

/// Largest memory map we accept; QEMU hands over a dozen entries.
const MAX_REGIONS: usize = 128;

fn convert_region(entry: &Entry) -> MemoryRegion {
    let kind = match entry.entry_type {
        EntryType::USABLE => RegionKind::Usable,
        EntryType::ACPI_RECLAIMABLE => RegionKind::AcpiReclaimable,
        EntryType::ACPI_NVS => RegionKind::AcpiNvs,
        EntryType::BAD_MEMORY => RegionKind::Bad,
        EntryType::BOOTLOADER_RECLAIMABLE => RegionKind::BootloaderReclaimable,
        EntryType::EXECUTABLE_AND_MODULES => RegionKind::ExecutableAndModules,
        EntryType::FRAMEBUFFER => RegionKind::Framebuffer,
        _ => RegionKind::Reserved,
    };
    MemoryRegion::new(entry.base, entry.length, kind)
}

/// Initialize the HHDM mapper and the physical allocator from the boot
/// memory map. Call once, before the VMM and the heap.
pub fn init(hhdm_offset: u64, entries: &[&Entry]) {
    let mapper = MAPPER.get_or_init(|| HhdmMapper::new(hhdm_offset));

    // No heap yet; stage the converted map in a fixed buffer.
    let mut regions = [MemoryRegion::new(0, 0, RegionKind::Reserved); MAX_REGIONS];
    let count = entries.len().min(MAX_REGIONS);
    for (slot, entry) in regions.iter_mut().zip(entries) {
        *slot = convert_region(entry);
    }

    let pmm = unsafe { BitmapFrameAllocator::init(&regions[..count], mapper) }
        .expect("physical memory init failed");
    info!(
        "PMM: {} MiB free across {} tracked pages",
        pmm.free_page_count() * 4 / 1024,
        pmm.total_pages()
    );
    let _ = PMM.get_or_init(|| SpinLock::new(pmm));
    info!("PMM: Initialization Complete");
}

/// The global HHDM mapper.
pub fn mapper() -> &'static HhdmMapper {
    MAPPER.get().expect("mem::init not called")
}

/// Direct-map offset.
pub fn hhdm_offset() -> u64 {
    mapper().offset()
}

/// Virtual address of physical `pa` inside the direct map.
pub fn phys_to_virt(pa: PhysAddr) -> VirtAddr {
    VirtAddr::new(pa.as_u64() + hhdm_offset())
}

/// Physical address behind a direct-map pointer. Only valid for
/// addresses produced by [`phys_to_virt`].
pub fn virt_to_phys(va: VirtAddr) -> PhysAddr {
    PhysAddr::new(va.as_u64() - hhdm_offset())
}

/// Run `f` with the physical allocator locked.
pub fn with_pmm<R>(f: impl FnOnce(&mut BitmapFrameAllocator) -> R) -> R {
    PMM.get().expect("mem::init not called").with_lock(f)
}

/// One zeroed frame for page tables and segment pages.
pub fn alloc_frame() -> Option<PhysAddr> {
    let frame = with_pmm(BitmapFrameAllocator::allocate_page)?;
    unsafe {
        let ptr: &mut u8 = mapper().phys_to_mut(frame);
        core::ptr::write_bytes(core::ptr::from_mut(ptr), 0, kernel_vmem::PAGE_SIZE as usize);
    }
    Some(frame)
}

/// Contiguous pages for the kernel-table `alloc_pages` service: physical
/// from the PMM, returned as a direct-map pointer. Null on exhaustion.
///
/// There is no matching free path for user programs yet; what they
/// allocate stays allocated (documented contract hole).
pub fn alloc_user_pages(count: usize) -> *mut u8 {
    match with_pmm(|pmm| pmm.allocate_pages(count)) {
        Some(pa) => phys_to_virt(pa).as_mut_ptr(),
        None => core::ptr::null_mut(),
    }
}
