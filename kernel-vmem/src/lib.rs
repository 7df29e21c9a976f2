//! # Virtual memory for a single shared address space
//!
//! x86_64 4-level paging primitives: typed addresses, page-table entries
//! with the supervisor protection-key field, and an [`AddressSpace`] that
//! walks and populates the tree. The kernel builds exactly one address
//! space, shared with every loaded program; what would be per-process
//! isolation elsewhere is expressed through the 4-bit key carried in each
//! leaf entry and checked against the per-CPU PKRS mask.
//!
//! ## The translation walk
//!
//! A canonical 48-bit virtual address splits into four 9-bit table indices
//! plus a page offset:
//!
//! ```text
//! | 47..39 | 38..30 | 29..21 | 20..12 | 11..0  |
//! |  PML4  |  PDPT  |   PD   |   PT   | offset |
//! ```
//!
//! Each level is an array of 512 64-bit entries. A PD entry with the
//! `huge` bit set is a 2 MiB leaf and ends the walk one level early;
//! otherwise translation continues down to a 4 KiB PT leaf. (1 GiB PDPT
//! leaves exist architecturally but this kernel never creates one.)
//!
//! ## Seams
//!
//! Page-table frames are physical memory, and the code that edits them can
//! run in three different worlds: the kernel proper (which reaches physical
//! memory through the higher-half direct map), early boot, and host-side
//! unit tests (which fake physical memory with an in-process arena). The
//! [`PhysMapper`] trait is that seam, and [`FrameAlloc`] is the matching
//! seam for where fresh table frames come from.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod address_space;
mod addresses;
mod page_table;

pub use address_space::{AddressSpace, MapError};
pub use addresses::{PhysAddr, VirtAddr};
pub use page_table::{EntryFlags, PageEntryBits, PageTable, ProtectionKey};

/// Bytes in a 4 KiB page.
pub const PAGE_SIZE: u64 = 4096;

/// Bytes in a 2 MiB huge page.
pub const HUGE_PAGE_SIZE: u64 = 2 * 1024 * 1024;

/// Source of zero-filled 4 KiB physical frames for page tables and page
/// allocations. Returned frames must be page-aligned; `None` means out of
/// physical memory.
pub trait FrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysAddr>;
}

/// Converts a physical address into a pointer usable in the current
/// virtual address space.
///
/// The kernel implements this as `virt = phys + hhdm_offset`; tests
/// implement it over an in-process arena. Keeping the conversion behind a
/// trait is what makes the walk code testable off-target.
///
/// # Safety
/// Implementations must only be used for physical ranges that are mapped
/// (writable, for `&mut` access) under the active page tables, and `T`
/// must match the bytes stored there.
pub trait PhysMapper {
    /// # Safety
    /// See the trait-level contract.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T;
}

/// View the frame at `phys` as a page table.
///
/// # Safety
/// `phys` must hold a valid (or freshly zeroed) page table, mapped
/// writable through `m`.
#[inline]
pub unsafe fn get_table<'a, M: PhysMapper>(m: &M, phys: PhysAddr) -> &'a mut PageTable {
    unsafe { m.phys_to_mut::<PageTable>(phys) }
}

/// Align `x` down to `a` (a power of two).
#[inline]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to `a` (a power of two). `x + a - 1` must not overflow.
#[inline]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

/// Drop one virtual page's translation from this CPU's TLB.
///
/// Required after changing a live mapping; newly created entries for
/// previously non-present pages are also flushed for simplicity.
///
/// # Safety
/// CPL 0 only.
#[cfg(target_arch = "x86_64")]
#[inline]
pub unsafe fn invalidate_page(va: VirtAddr) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hands out consecutive frames from a fixed physical range; the test
    /// stand-in for the real bitmap allocator.
    struct BumpAlloc {
        next: u64,
        end: u64,
    }

    impl BumpAlloc {
        fn new(start: u64, end: u64) -> Self {
            Self { next: start, end }
        }
    }

    impl FrameAlloc for BumpAlloc {
        fn alloc_4k(&mut self) -> Option<PhysAddr> {
            if self.next + PAGE_SIZE > self.end {
                return None;
            }
            let pa = self.next;
            self.next += PAGE_SIZE;
            Some(PhysAddr::new(pa))
        }
    }

    #[repr(align(4096))]
    struct Frame([u8; 4096]);

    /// In-process "physical RAM": physical address == byte offset into a
    /// vector of page-aligned frames.
    struct TestPhys {
        frames: Vec<Frame>,
    }

    impl TestPhys {
        fn with_frames(n: usize) -> Self {
            let mut frames = Vec::with_capacity(n);
            frames.resize_with(n, || Frame([0u8; 4096]));
            Self { frames }
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T {
            let idx = (pa.as_u64() >> 12) as usize;
            let off = (pa.as_u64() & 0xFFF) as usize;
            let base = self.frames[idx].0.as_ptr() as *mut u8;
            unsafe { &mut *base.add(off).cast::<T>() }
        }
    }

    fn fresh_space<'a>(phys: &'a TestPhys, alloc: &mut BumpAlloc) -> AddressSpace<'a, TestPhys> {
        let root = alloc.alloc_4k().unwrap();
        unsafe { get_table(phys, root).zero() };
        AddressSpace::new(phys, root)
    }

    #[test]
    fn map_page_builds_all_four_levels() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(0, 64 * PAGE_SIZE);
        let space = fresh_space(&phys, &mut alloc);

        let va = VirtAddr::new(0xFFFF_8000_0000_0000);
        let pa = PhysAddr::new(0x30_0000);
        space
            .map_page(&mut alloc, va, pa, EntryFlags::WRITABLE | EntryFlags::NO_EXECUTE, ProtectionKey::KERNEL)
            .expect("map_page");

        unsafe {
            let pml4 = get_table(&phys, space.root());
            let e4 = pml4.entry(va.pml4_index());
            assert!(e4.present());
            assert!(e4.writable());
            assert_eq!(e4.protection_key(), 0, "intermediates carry no key");

            let pdpt = get_table(&phys, e4.frame());
            let e3 = pdpt.entry(va.pdpt_index());
            assert!(e3.present() && !e3.huge());

            let pd = get_table(&phys, e3.frame());
            let e2 = pd.entry(va.pd_index());
            assert!(e2.present() && !e2.huge());

            let pt = get_table(&phys, e2.frame());
            let e1 = pt.entry(va.pt_index());
            assert!(e1.present());
            assert!(e1.writable());
            assert!(e1.no_execute());
            assert!(!e1.huge());
            assert_eq!(e1.frame().as_u64(), pa.as_u64());
        }
    }

    #[test]
    fn protection_key_lands_in_bits_59_to_62() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(0, 64 * PAGE_SIZE);
        let space = fresh_space(&phys, &mut alloc);

        let va = VirtAddr::new(0xFFFF_9000_0000_0000);
        let pa = PhysAddr::new(0x40_0000);
        space
            .map_page(&mut alloc, va, pa, EntryFlags::WRITABLE, ProtectionKey::new(0b1011))
            .expect("map_page");

        unsafe {
            let raw = space.leaf_entry(va).expect("mapped").into_bits();
            assert_eq!((raw >> 59) & 0xF, 0b1011);
            // Key bits are separate from the frame bits.
            assert_eq!(raw & 0x000F_FFFF_FFFF_F000, pa.as_u64());
        }
    }

    #[test]
    fn flag_updates_preserve_the_key() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(0, 64 * PAGE_SIZE);
        let space = fresh_space(&phys, &mut alloc);

        let va = VirtAddr::new(0xFFFF_A000_0000_0000);
        let pa = PhysAddr::new(0x50_0000);
        let key = ProtectionKey::new(5);
        space
            .map_page(&mut alloc, va, pa, EntryFlags::WRITABLE, key)
            .expect("map_page");

        // Remap the same page read-only with extra flags; the key must ride
        // along untouched.
        space
            .map_page(&mut alloc, va, pa, EntryFlags::GLOBAL | EntryFlags::NO_EXECUTE, key)
            .expect("remap");

        let leaf = unsafe { space.leaf_entry(va) }.expect("mapped");
        assert_eq!(leaf.protection_key(), 5);
        assert!(!leaf.writable());
        assert!(leaf.global());
    }

    #[test]
    fn map_huge_page_terminates_at_the_pd() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(0, 64 * PAGE_SIZE);
        let space = fresh_space(&phys, &mut alloc);

        let va = VirtAddr::new(0xFFFF_8000_2000_0000);
        let pa = PhysAddr::new(0x40_0000); // 2 MiB aligned
        space
            .map_huge_page(&mut alloc, va, pa, EntryFlags::WRITABLE, ProtectionKey::KERNEL)
            .expect("map_huge_page");

        unsafe {
            let pml4 = get_table(&phys, space.root());
            let pdpt = get_table(&phys, pml4.entry(va.pml4_index()).frame());
            let pd = get_table(&phys, pdpt.entry(va.pdpt_index()).frame());
            let e2 = pd.entry(va.pd_index());
            assert!(e2.present());
            assert!(e2.huge());
            assert!(e2.writable());
            assert_eq!(e2.frame().as_u64(), pa.as_u64());
        }

        assert_eq!(
            space.query(VirtAddr::new(va.as_u64() + 0x12_3456)),
            Some(PhysAddr::new(pa.as_u64() + 0x12_3456))
        );
    }

    #[test]
    fn query_translates_through_4k_leaves() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(0, 64 * PAGE_SIZE);
        let space = fresh_space(&phys, &mut alloc);

        let va = VirtAddr::new(0xFFFF_8000_0000_3000);
        let pa = PhysAddr::new(0x7000);
        space
            .map_page(&mut alloc, va, pa, EntryFlags::WRITABLE, ProtectionKey::KERNEL)
            .expect("map_page");

        assert_eq!(
            space.query(VirtAddr::new(va.as_u64() + 0xAB)),
            Some(PhysAddr::new(pa.as_u64() + 0xAB))
        );
        assert_eq!(space.query(VirtAddr::new(0xFFFF_8000_0000_4000)), None);
    }

    #[test]
    fn mapping_fails_cleanly_when_frames_run_out() {
        let phys = TestPhys::with_frames(4);
        // Room for the root and one intermediate, then dry.
        let mut alloc = BumpAlloc::new(0, 2 * PAGE_SIZE);
        let space = fresh_space(&phys, &mut alloc);

        let err = space
            .map_page(
                &mut alloc,
                VirtAddr::new(0xFFFF_8000_0000_0000),
                PhysAddr::new(0x1000),
                EntryFlags::WRITABLE,
                ProtectionKey::KERNEL,
            )
            .unwrap_err();
        assert!(matches!(err, MapError::OutOfMemory(_)));
    }

    #[test]
    fn writes_through_a_mapping_hit_the_backing_frame() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(0, 32 * PAGE_SIZE);
        let space = fresh_space(&phys, &mut alloc);

        // Map a frame outside the allocator range so nothing else touches it.
        let target = PhysAddr::new(40 * PAGE_SIZE);
        let va = VirtAddr::new(0xFFFF_8000_0010_0000);
        space
            .map_page(&mut alloc, va, target, EntryFlags::WRITABLE, ProtectionKey::KERNEL)
            .expect("map_page");

        // The test arena plays the role of the direct map: resolve the
        // mapping, write through the "virtual" side, observe the physical.
        let resolved = space.query(va).expect("mapped");
        assert_eq!(resolved, target);
        unsafe {
            let byte: &mut u8 = phys.phys_to_mut(resolved);
            *byte = 0x5A;
            let observed: &mut u8 = phys.phys_to_mut(target);
            assert_eq!(*observed, 0x5A);
        }
    }
}
