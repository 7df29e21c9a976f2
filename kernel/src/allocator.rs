//! The global kernel allocator: `kernel-heap` over the PMM.
//!
//! The segregated-list heap pulls pages from the physical allocator and
//! addresses them through the direct map, so there is no separate heap
//! window to reserve and no init step: the first allocation after
//! `mem::init` just works. Small classes recycle within the heap; large
//! allocations give their pages straight back to the PMM on free.

use crate::mem;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;
use kernel_heap::{PAGE_SIZE, PageProvider, SlabHeap};
use kernel_sync::{IrqGuard, SpinLock};
use kernel_vmem::VirtAddr;

/// Page backing from the PMM, addressed through the HHDM.
struct PmmPages;

impl PageProvider for PmmPages {
    fn alloc_pages(&mut self, count: usize) -> Option<NonNull<u8>> {
        let pa = mem::with_pmm(|pmm| pmm.allocate_pages(count))?;
        NonNull::new(mem::phys_to_virt(pa).as_mut_ptr())
    }

    fn free_pages(&mut self, ptr: NonNull<u8>, count: usize) {
        let pa = mem::virt_to_phys(VirtAddr::from_ptr(ptr.as_ptr()));
        mem::with_pmm(|pmm| pmm.free_pages(pa, count));
    }
}

struct KernelAllocator {
    heap: SpinLock<SlabHeap<PmmPages>>,
}

/// Alignment is served by size: blocks are aligned to their (power of
/// two) class and whole pages to 4096, so growing the request to the
/// alignment is sufficient. Anything above a page is not honored.
fn effective_len(layout: Layout) -> Option<usize> {
    (layout.align() <= PAGE_SIZE).then(|| layout.size().max(layout.align()))
}

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let Some(len) = effective_len(layout) else {
            return core::ptr::null_mut();
        };
        let _irq = IrqGuard::new();
        self.heap
            .lock()
            .alloc(len)
            .map_or(core::ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let Some(len) = effective_len(layout) else {
            return;
        };
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        let _irq = IrqGuard::new();
        unsafe { self.heap.lock().free(ptr, len) };
    }
}

#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator {
    heap: SpinLock::new(SlabHeap::new(PmmPages)),
};
