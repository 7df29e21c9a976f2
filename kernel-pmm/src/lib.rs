//! # Physical memory manager
//!
//! A bitmap allocator over the bootloader's memory map: one bit per 4 KiB
//! page, set meaning "not free". The bitmap itself is carved out of the
//! first usable region large enough to hold it and is reached through the
//! same [`PhysMapper`] seam the rest of the memory code uses, so the whole
//! allocator runs unmodified against an in-process arena in tests.
//!
//! Allocation hands out physically *contiguous* runs. The search keeps a
//! roving cursor: the first pass scans from the cursor to the end, the
//! second wraps around from page 0, and within a pass the lowest-indexed
//! run wins. Freeing pulls the cursor back so small frees are found again
//! quickly. Out of memory is a `None`, never a panic.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

use kernel_vmem::{FrameAlloc, PAGE_SIZE, PhysAddr, PhysMapper, align_down, align_up};

/// Region types reported by the boot protocol's memory map.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegionKind {
    Usable,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    Bad,
    BootloaderReclaimable,
    ExecutableAndModules,
    Framebuffer,
}

/// One entry of the physical memory map.
#[derive(Debug, Copy, Clone)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: RegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: RegionKind) -> Self {
        Self { base, length, kind }
    }

    const fn end(&self) -> u64 {
        self.base + self.length
    }

    /// Regions that count toward the bitmap's high watermark: everything
    /// the kernel may ever own or hand back.
    const fn tracked(&self) -> bool {
        matches!(
            self.kind,
            RegionKind::Usable | RegionKind::BootloaderReclaimable | RegionKind::ExecutableAndModules
        )
    }
}

/// Low 1 MiB stays reserved: legacy BIOS structures, VGA, the works.
const LOW_MEMORY_BYTES: u64 = 1024 * 1024;
const LOW_MEMORY_PAGES: usize = (LOW_MEMORY_BYTES / PAGE_SIZE) as usize;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PmmInitError {
    /// The memory map contained no region to track at all.
    #[error("memory map has no usable regions")]
    EmptyMemoryMap,
    /// No usable region was large enough to hold the bitmap.
    #[error("no usable region can hold the {0}-byte page bitmap")]
    BitmapDoesNotFit(usize),
}

/// The bitmap frame allocator.
///
/// Owns a raw view of its bitmap storage (which lives inside managed
/// physical memory, not on any heap). All mutation goes through `&mut
/// self`; the kernel wraps the allocator in a spinlock.
#[derive(Debug)]
pub struct BitmapFrameAllocator {
    bitmap: *mut u8,
    total_pages: usize,
    /// Roving search cursor, in pages.
    last_index: usize,
    free_pages: usize,
}

// Safety: `bitmap` is an exclusive view of memory this allocator owns.
unsafe impl Send for BitmapFrameAllocator {}

impl BitmapFrameAllocator {
    /// Build the allocator from the boot memory map.
    ///
    /// Walks `regions` to find the high watermark across tracked kinds,
    /// places the bitmap in the first usable region that fits it, marks
    /// everything reserved, then frees whole pages of usable regions and
    /// re-reserves the bitmap's own pages plus the first 1 MiB.
    ///
    /// # Errors
    /// See [`PmmInitError`].
    ///
    /// # Safety
    /// `regions` must describe real, unaliased physical memory, and
    /// `mapper` must make all of it addressable. Usable regions must not
    /// overlap anything in use.
    pub unsafe fn init<M: PhysMapper>(
        regions: &[MemoryRegion],
        mapper: &M,
    ) -> Result<Self, PmmInitError> {
        let max_address = regions
            .iter()
            .filter(|r| r.tracked())
            .map(MemoryRegion::end)
            .max()
            .ok_or(PmmInitError::EmptyMemoryMap)?;

        let total_pages = (max_address.div_ceil(PAGE_SIZE)) as usize;
        let bitmap_bytes = total_pages.div_ceil(8);

        let bitmap_base = regions
            .iter()
            .find(|r| {
                r.kind == RegionKind::Usable
                    && r.base >= LOW_MEMORY_BYTES
                    && r.length >= bitmap_bytes as u64
            })
            .map(|r| r.base)
            .ok_or(PmmInitError::BitmapDoesNotFit(bitmap_bytes))?;

        let bitmap: *mut u8 = unsafe { mapper.phys_to_mut::<u8>(PhysAddr::new(bitmap_base)) };
        unsafe {
            core::ptr::write_bytes(bitmap, 0xFF, bitmap_bytes);
        }

        let mut pmm = Self {
            bitmap,
            total_pages,
            last_index: 0,
            free_pages: 0,
        };

        // Free usable memory, whole pages only. A partial page at either
        // edge stays reserved.
        for region in regions.iter().filter(|r| r.kind == RegionKind::Usable) {
            let first = (align_up(region.base, PAGE_SIZE) / PAGE_SIZE) as usize;
            let last = (align_down(region.end(), PAGE_SIZE) / PAGE_SIZE) as usize;
            for page in first..last {
                if pmm.take_bit(page, false) {
                    pmm.free_pages += 1;
                }
            }
        }

        // The bitmap's own backing pages are in a usable region and were
        // just freed; claw them back.
        let bitmap_first = (bitmap_base / PAGE_SIZE) as usize;
        let bitmap_last = (align_up(bitmap_base + bitmap_bytes as u64, PAGE_SIZE) / PAGE_SIZE) as usize;
        for page in bitmap_first..bitmap_last {
            if pmm.take_bit(page, true) {
                pmm.free_pages -= 1;
            }
        }

        // And the legacy low megabyte, which some maps report usable.
        for page in 0..LOW_MEMORY_PAGES.min(total_pages) {
            if pmm.take_bit(page, true) {
                pmm.free_pages -= 1;
            }
        }

        Ok(pmm)
    }

    /// Allocate `count` physically contiguous pages.
    ///
    /// Returns the base address of the run, or `None` when no contiguous
    /// run of that length exists. No retries, no blocking.
    pub fn allocate_pages(&mut self, count: usize) -> Option<PhysAddr> {
        if count == 0 || count > self.total_pages {
            return None;
        }

        let start = self
            .find_run(self.last_index, self.total_pages, count)
            .or_else(|| self.find_run(0, self.last_index, count))?;

        for page in start..start + count {
            self.take_bit(page, true);
        }
        self.free_pages -= count;
        self.last_index = start + count;
        Some(PhysAddr::new(start as u64 * PAGE_SIZE))
    }

    /// Allocate a single page.
    pub fn allocate_page(&mut self) -> Option<PhysAddr> {
        self.allocate_pages(1)
    }

    /// Return `count` pages starting at `base` to the free pool.
    ///
    /// Page numbers beyond the tracked range are ignored. The search
    /// cursor retreats to the freed base so the space is reconsidered on
    /// the next allocation.
    pub fn free_pages(&mut self, base: PhysAddr, count: usize) {
        let first = base.page_number();
        for page in first..first.saturating_add(count) {
            if page >= self.total_pages {
                break;
            }
            if self.take_bit(page, false) {
                self.free_pages += 1;
            }
        }
        if first < self.last_index {
            self.last_index = first;
        }
    }

    /// Whether the page holding `addr` is currently marked allocated or
    /// reserved. `None` outside the tracked range.
    #[must_use]
    pub fn is_used(&self, addr: PhysAddr) -> Option<bool> {
        let page = addr.page_number();
        (page < self.total_pages).then(|| self.bit(page))
    }

    /// Pages the allocator tracks in total.
    #[must_use]
    pub const fn total_pages(&self) -> usize {
        self.total_pages
    }

    /// Pages currently free.
    #[must_use]
    pub const fn free_page_count(&self) -> usize {
        self.free_pages
    }

    /// First run of `count` clear bits in `[from, to)`, lowest index wins.
    fn find_run(&self, from: usize, to: usize, count: usize) -> Option<usize> {
        let mut run = 0usize;
        for page in from..to {
            if self.bit(page) {
                run = 0;
            } else {
                run += 1;
                if run == count {
                    return Some(page + 1 - count);
                }
            }
        }
        None
    }

    fn bit(&self, page: usize) -> bool {
        debug_assert!(page < self.total_pages);
        let byte = unsafe { *self.bitmap.add(page / 8) };
        byte & (1 << (page % 8)) != 0
    }

    /// Set or clear one bit; reports whether the bit changed.
    fn take_bit(&mut self, page: usize, used: bool) -> bool {
        debug_assert!(page < self.total_pages);
        let byte = unsafe { &mut *self.bitmap.add(page / 8) };
        let mask = 1 << (page % 8);
        let was = *byte & mask != 0;
        if used {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
        was != used
    }
}

impl FrameAlloc for BitmapFrameAllocator {
    fn alloc_4k(&mut self) -> Option<PhysAddr> {
        self.allocate_page()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    /// 8 MiB of fake physical memory; physical address == arena offset.
    struct Arena {
        backing: Vec<u64>,
    }

    impl Arena {
        fn new(bytes: usize) -> Self {
            Self {
                backing: vec![0u64; bytes / 8],
            }
        }
    }

    impl PhysMapper for Arena {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T {
            let base = self.backing.as_ptr() as *mut u8;
            unsafe { &mut *base.add(pa.as_u64() as usize).cast::<T>() }
        }
    }

    /// One usable region from 1 MiB to 8 MiB; everything below is legacy.
    fn boot_map() -> Vec<MemoryRegion> {
        vec![
            MemoryRegion::new(0, 0x9F000, RegionKind::Usable),
            MemoryRegion::new(0x9F000, MIB - 0x9F000, RegionKind::Reserved),
            MemoryRegion::new(MIB, 7 * MIB, RegionKind::Usable),
        ]
    }

    fn fresh() -> (Arena, BitmapFrameAllocator) {
        let arena = Arena::new(8 * MIB as usize);
        let pmm = unsafe { BitmapFrameAllocator::init(&boot_map(), &arena) }.unwrap();
        (arena, pmm)
    }

    #[test]
    fn init_reserves_low_memory_and_the_bitmap() {
        let (_arena, pmm) = fresh();

        assert_eq!(pmm.total_pages(), 2048); // 8 MiB / 4 KiB
        // Low 1 MiB reserved even though part of it was usable.
        assert_eq!(pmm.is_used(PhysAddr::new(0)), Some(true));
        assert_eq!(pmm.is_used(PhysAddr::new(0x9E000)), Some(true));
        // The bitmap sits at 1 MiB (first fitting usable region) and is
        // 2048 bits / 8 = 256 bytes, one page.
        assert_eq!(pmm.is_used(PhysAddr::new(MIB)), Some(true));
        assert_eq!(pmm.is_used(PhysAddr::new(MIB + PAGE_SIZE)), Some(false));
        // 7 MiB usable minus one bitmap page.
        assert_eq!(pmm.free_page_count(), 7 * 256 - 1);
    }

    #[test]
    fn allocations_are_page_aligned_marked_and_disjoint() {
        let (_arena, mut pmm) = fresh();

        let mut seen = Vec::new();
        for _ in 0..64 {
            let a = pmm.allocate_pages(3).expect("in memory");
            assert_eq!(a.as_u64() % PAGE_SIZE, 0);
            assert_eq!(pmm.is_used(a), Some(true));
            for prior in &seen {
                let distance = a.as_u64().abs_diff(*prior);
                assert!(distance >= 3 * PAGE_SIZE, "ranges overlap");
            }
            seen.push(a.as_u64());
        }
    }

    #[test]
    fn free_then_reallocate_returns_the_same_base() {
        let (_arena, mut pmm) = fresh();

        let a = pmm.allocate_pages(4).unwrap();
        let b = pmm.allocate_pages(4).unwrap();
        assert_ne!(a.as_u64(), b.as_u64());

        pmm.free_pages(a, 4);
        for i in 0..4 {
            assert_eq!(
                pmm.is_used(PhysAddr::new(a.as_u64() + i * PAGE_SIZE)),
                Some(false)
            );
        }
        // The cursor retreated to the freed base, so the same run wins.
        assert_eq!(pmm.allocate_pages(4).unwrap(), a);
    }

    #[test]
    fn two_pages_freed_in_reverse_then_lower_wins() {
        let (_arena, mut pmm) = fresh();

        let first = pmm.allocate_page().unwrap();
        let second = pmm.allocate_page().unwrap();
        assert_ne!(first.as_u64(), second.as_u64());

        pmm.free_pages(second, 1);
        pmm.free_pages(first, 1);
        let third = pmm.allocate_page().unwrap();
        assert_eq!(third, first, "lower of the two freed pages wins");
    }

    #[test]
    fn exhaustion_returns_none_without_panicking() {
        let (_arena, mut pmm) = fresh();

        let free = pmm.free_page_count();
        // No contiguous run that large can exist.
        assert!(pmm.allocate_pages(free + 1).is_none());

        // Drain completely, single pages.
        let mut taken = 0;
        while pmm.allocate_page().is_some() {
            taken += 1;
        }
        assert_eq!(taken, free);
        assert_eq!(pmm.free_page_count(), 0);
        assert!(pmm.allocate_page().is_none());
    }

    #[test]
    fn free_beyond_the_tracked_range_is_ignored() {
        let (_arena, mut pmm) = fresh();
        let free = pmm.free_page_count();
        pmm.free_pages(PhysAddr::new(64 * MIB), 16);
        assert_eq!(pmm.free_page_count(), free);
    }

    #[test]
    fn partial_pages_at_region_edges_stay_reserved() {
        let arena = Arena::new(8 * MIB as usize);
        let map = vec![
            // Half-page slivers at both ends must not be freed.
            MemoryRegion::new(2 * MIB + 0x800, 2 * MIB - 0x1000, RegionKind::Usable),
            MemoryRegion::new(MIB, MIB, RegionKind::Usable),
        ];
        let pmm = unsafe { BitmapFrameAllocator::init(&map, &arena) }.unwrap();

        // The sliver's containing pages are reserved...
        assert_eq!(pmm.is_used(PhysAddr::new(2 * MIB)), Some(true));
        // ...but the first fully covered page is free.
        assert_eq!(pmm.is_used(PhysAddr::new(2 * MIB + PAGE_SIZE)), Some(false));
    }

    #[test]
    fn init_requires_a_region_that_fits_the_bitmap() {
        let arena = Arena::new(8 * MIB as usize);
        // Tracked watermark of 4 GiB needs a 128 KiB bitmap; the only
        // usable region is one page.
        let map = vec![
            MemoryRegion::new(MIB, PAGE_SIZE, RegionKind::Usable),
            MemoryRegion::new(4 * 1024 * MIB - MIB, MIB, RegionKind::ExecutableAndModules),
        ];
        let err = unsafe { BitmapFrameAllocator::init(&map, &arena) }.unwrap_err();
        assert!(matches!(err, PmmInitError::BitmapDoesNotFit(_)));
    }
}
