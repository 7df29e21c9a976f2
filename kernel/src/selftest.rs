//! In-kernel selftests.
//!
//! The host-side unit tests cover everything that is pure logic; these
//! scenarios need the real machine: the PMM over the real memory map, the
//! heap over the PMM, live page-table edits, the published kernel table.
//! Built with the `selftest` feature, run instead of the shell, reported
//! through the QEMU debug-exit device.
//!
//! With `expect-pks` the suite also demands that the CPU actually has
//! protection keys (the plain `test` target boots with `-cpu max,+pks`);
//! without it a PKS-less boot must still reach a working heap.

use crate::serial::kprintln;
use crate::{ktable, mem, pks, vmem};
use alloc::vec::Vec;
use kernel_abi::KERNEL_TABLE_MAGIC;
use kernel_qemu::ExitCode;
use kernel_vmem::{EntryFlags, PAGE_SIZE, ProtectionKey, VirtAddr};

type TestResult = Result<(), &'static str>;

const TESTS: &[(&str, fn() -> TestResult)] = &[
    ("pmm_alloc_is_aligned_and_tracked", pmm_alloc_is_aligned_and_tracked),
    ("pmm_free_order_prefers_lower", pmm_free_order_prefers_lower),
    ("heap_two_hundred_small_objects", heap_two_hundred_small_objects),
    ("heap_large_spans_two_pages", heap_large_spans_two_pages),
    ("vmm_mapping_is_visible_through_hhdm", vmm_mapping_is_visible_through_hhdm),
    ("kernel_table_handshake", kernel_table_handshake),
    ("keyboard_queue_starts_empty", keyboard_queue_starts_empty),
    ("pks_status_matches_expectation", pks_status_matches_expectation),
];

pub fn run() -> ! {
    kprintln!("selftest: running {} scenarios", TESTS.len());

    let mut failed = 0;
    for (name, test) in TESTS {
        match test() {
            Ok(()) => kprintln!("selftest: {name}: ok"),
            Err(why) => {
                failed += 1;
                kprintln!("selftest: {name}: FAILED: {why}");
            }
        }
    }

    if failed == 0 {
        kprintln!("selftest: all {} passed", TESTS.len());
        kernel_qemu::exit(ExitCode::Success)
    } else {
        kprintln!("selftest: {failed} failed");
        kernel_qemu::exit(ExitCode::Failure)
    }
}

fn pmm_alloc_is_aligned_and_tracked() -> TestResult {
    let a = mem::with_pmm(|pmm| pmm.allocate_pages(2)).ok_or("out of memory")?;
    let b = mem::with_pmm(|pmm| pmm.allocate_pages(2)).ok_or("out of memory")?;

    if a.as_u64() % PAGE_SIZE != 0 || b.as_u64() % PAGE_SIZE != 0 {
        return Err("allocation not page aligned");
    }
    if a.as_u64().abs_diff(b.as_u64()) < 2 * PAGE_SIZE {
        return Err("ranges overlap");
    }
    let tracked = mem::with_pmm(|pmm| pmm.is_used(a)) == Some(true);
    if !tracked {
        return Err("allocated page not marked in the bitmap");
    }

    mem::with_pmm(|pmm| {
        pmm.free_pages(a, 2);
        pmm.free_pages(b, 2);
    });
    Ok(())
}

fn pmm_free_order_prefers_lower() -> TestResult {
    let first = mem::with_pmm(|pmm| pmm.allocate_page()).ok_or("out of memory")?;
    let second = mem::with_pmm(|pmm| pmm.allocate_page()).ok_or("out of memory")?;
    if first == second {
        return Err("distinct allocations returned the same page");
    }

    // Free high then low; the next allocation must take the lower.
    mem::with_pmm(|pmm| {
        pmm.free_pages(second, 1);
        pmm.free_pages(first, 1);
    });
    let third = mem::with_pmm(|pmm| pmm.allocate_page()).ok_or("out of memory")?;
    let ok = third == first.min(second);
    mem::with_pmm(|pmm| pmm.free_pages(third, 1));
    if ok { Ok(()) } else { Err("reallocation did not return the lower page") }
}

fn heap_two_hundred_small_objects() -> TestResult {
    let mut boxes = Vec::new();
    for i in 0..200u32 {
        boxes.push(alloc::boxed::Box::new(i));
    }
    for (i, b) in boxes.iter().enumerate() {
        if **b != i as u32 {
            return Err("stored value corrupted");
        }
    }
    let mut seen: Vec<usize> = boxes.iter().map(|b| core::ptr::from_ref(&**b) as usize).collect();
    seen.sort_unstable();
    seen.dedup();
    if seen.len() != 200 {
        return Err("allocations not distinct");
    }
    drop(boxes);

    // The same load again must succeed from recycled blocks.
    let again: Vec<_> = (0..200u32).map(alloc::boxed::Box::new).collect();
    if again.len() != 200 { Err("reallocation failed") } else { Ok(()) }
}

fn heap_large_spans_two_pages() -> TestResult {
    use alloc::alloc::{alloc, dealloc};
    use core::alloc::Layout;

    let l3000 = Layout::from_size_align(3000, 8).map_err(|_| "layout")?;
    let l5000 = Layout::from_size_align(5000, 8).map_err(|_| "layout")?;
    unsafe {
        let a = alloc(l3000);
        let b = alloc(l5000);
        if a.is_null() || b.is_null() {
            return Err("large allocation failed");
        }
        // 5000 bytes round up to two pages; the byte past the first page
        // boundary must be writable and independent.
        b.write(0x11);
        b.add(PAGE_SIZE as usize).write(0x22);
        b.add(4999).write(0x33);
        if b.read() != 0x11 || b.add(PAGE_SIZE as usize).read() != 0x22 {
            return Err("page-spanning write lost");
        }
        dealloc(b, l5000);
        dealloc(a, l3000);
    }
    Ok(())
}

fn vmm_mapping_is_visible_through_hhdm() -> TestResult {
    // A virtual page nothing else uses (PML4 slot 0x1E0).
    const PROBE_VA: u64 = 0xFFFF_F000_0000_0000;

    let frame = mem::alloc_frame().ok_or("out of memory")?;
    vmem::map_page(
        VirtAddr::new(PROBE_VA),
        frame,
        EntryFlags::WRITABLE | EntryFlags::NO_EXECUTE,
        ProtectionKey::KERNEL,
    )
    .map_err(|_| "map_page failed")?;

    unsafe {
        let through_mapping = PROBE_VA as *mut u64;
        through_mapping.write_volatile(0x5EED_F00D_CAFE_D00D);
        let through_hhdm = mem::phys_to_virt(frame).as_mut_ptr::<u64>();
        if through_hhdm.read_volatile() != 0x5EED_F00D_CAFE_D00D {
            return Err("write not visible through the direct map");
        }
    }

    if vmem::query(VirtAddr::new(PROBE_VA)) != Some(frame) {
        return Err("query disagrees with the installed mapping");
    }
    Ok(())
}

fn kernel_table_handshake() -> TestResult {
    let table = ktable::table();
    if table.magic != KERNEL_TABLE_MAGIC {
        return Err("magic mismatch");
    }
    if core::mem::size_of_val(table) != 48 {
        return Err("table size drifted");
    }
    // Exercise two entries through the pointers, as a program would.
    (table.draw_rect)(0, 0, 4, 4, 0xFF00_FF00);
    let page = (table.alloc_pages)(1);
    if page.is_null() {
        return Err("alloc_pages returned null with memory free");
    }
    unsafe { page.write_volatile(0xA5) };
    Ok(())
}

fn keyboard_queue_starts_empty() -> TestResult {
    // Nothing has been typed in a headless test boot; poll must report
    // "no key" rather than blocking.
    if crate::keyboard::poll() != 0 {
        return Err("phantom key in the buffer");
    }
    Ok(())
}

fn pks_status_matches_expectation() -> TestResult {
    if cfg!(feature = "expect-pks") && !pks::available() {
        return Err("CPU lacks PKS but the test expects it");
    }
    if pks::available() {
        // All keys must start permissive.
        if pks::rights_mask() != 0 {
            return Err("PKRS not cleared at init");
        }
        unsafe {
            pks::set_rights_mask(kernel_registers::Ia32Pkrs::deny_access(15));
            let readback = pks::rights_mask();
            pks::set_rights_mask(0);
            if readback != kernel_registers::Ia32Pkrs::deny_access(15) {
                return Err("PKRS write did not stick");
            }
        }
    }
    Ok(())
}
