use crate::addresses::{PhysAddr, VirtAddr};
use crate::page_table::{EntryFlags, PageEntryBits, PageTable, ProtectionKey};
use crate::{FrameAlloc, HUGE_PAGE_SIZE, PhysMapper, get_table};

/// Failure while installing a mapping.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// The frame allocator ran dry while creating the named intermediate
    /// table.
    #[error("out of physical memory allocating a {0}")]
    OutOfMemory(&'static str),
}

/// A view over one page-table tree, addressed by the physical location of
/// its PML4.
///
/// The type does not own any memory; it edits tables in place through the
/// caller's [`PhysMapper`]. Missing intermediate levels are allocated
/// lazily on first mapping and never freed (table teardown is outside this
/// kernel's scope). TLB maintenance is the caller's job: when editing the
/// *active* tree, invalidate the touched page afterwards.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysAddr,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Wrap an existing (possibly empty, zeroed) PML4 at `root`.
    #[must_use]
    pub const fn new(mapper: &'m M, root: PhysAddr) -> Self {
        Self { root, mapper }
    }

    /// View of the currently active tree.
    ///
    /// # Safety
    /// CPL 0 with paging enabled; CR3 must reference a tree reachable
    /// through `mapper`.
    #[cfg(target_arch = "x86_64")]
    #[must_use]
    pub unsafe fn from_current(mapper: &'m M) -> Self {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::new(mapper, PhysAddr::new(cr3 & 0x000F_FFFF_FFFF_F000))
    }

    /// Physical address of the PML4.
    #[must_use]
    pub const fn root(&self) -> PhysAddr {
        self.root
    }

    /// Map the 4 KiB page at `va` to the frame at `pa`.
    ///
    /// Intermediate tables are created as present and writable with key 0;
    /// only the leaf carries `flags` and `key`. Remapping an already
    /// present page replaces the leaf wholesale.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] when an intermediate cannot be allocated.
    pub fn map_page<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtAddr,
        pa: PhysAddr,
        flags: EntryFlags,
        key: ProtectionKey,
    ) -> Result<(), MapError> {
        debug_assert_eq!(pa.as_u64() & 0xFFF, 0, "frame not 4 KiB aligned");

        let pt = self.ensure_chain(alloc, va)?;
        pt.set_entry(va.pt_index(), PageEntryBits::leaf(pa, flags, key));
        Ok(())
    }

    /// Map the 2 MiB page at `va` to `pa` with a PD leaf.
    ///
    /// `pa` must be 2 MiB aligned (caller guarantee).
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] when an intermediate cannot be allocated.
    pub fn map_huge_page<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtAddr,
        pa: PhysAddr,
        flags: EntryFlags,
        key: ProtectionKey,
    ) -> Result<(), MapError> {
        debug_assert_eq!(pa.as_u64() % HUGE_PAGE_SIZE, 0, "frame not 2 MiB aligned");

        let pd = self.ensure_pd(alloc, va)?;
        pd.set_entry(
            va.pd_index(),
            PageEntryBits::leaf(pa, flags, key).with_huge(true),
        );
        Ok(())
    }

    /// Translate `va` if mapped (4 KiB and 2 MiB leaves).
    #[must_use]
    pub fn query(&self, va: VirtAddr) -> Option<PhysAddr> {
        let leaf = unsafe { self.leaf_entry(va) }?;
        let offset_mask = if leaf.huge() {
            HUGE_PAGE_SIZE - 1
        } else {
            0xFFF
        };
        Some(PhysAddr::new(
            leaf.frame().as_u64() | (va.as_u64() & offset_mask),
        ))
    }

    /// The leaf entry covering `va`, if the walk reaches one.
    ///
    /// # Safety
    /// All table frames reachable from the root must be valid through the
    /// mapper.
    pub unsafe fn leaf_entry(&self, va: VirtAddr) -> Option<PageEntryBits> {
        unsafe {
            let pml4 = get_table(self.mapper, self.root);
            let e4 = pml4.entry(va.pml4_index());
            if !e4.present() {
                return None;
            }
            let pdpt = get_table(self.mapper, e4.frame());
            let e3 = pdpt.entry(va.pdpt_index());
            if !e3.present() {
                return None;
            }
            let pd = get_table(self.mapper, e3.frame());
            let e2 = pd.entry(va.pd_index());
            if !e2.present() {
                return None;
            }
            if e2.huge() {
                return Some(e2);
            }
            let pt = get_table(self.mapper, e2.frame());
            let e1 = pt.entry(va.pt_index());
            e1.present().then_some(e1)
        }
    }

    /// Load CR3 with this tree's root.
    ///
    /// # Safety
    /// The tree must map the executing code, the current stack, and every
    /// datum touched before the next switch. Non-global TLB entries are
    /// flushed as a side effect.
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn activate(&self) {
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) self.root.as_u64(), options(nostack, preserves_flags));
        }
    }

    /// Walk (and build) PML4 -> PDPT -> PD for `va`.
    fn ensure_pd<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtAddr,
    ) -> Result<&mut PageTable, MapError> {
        let pml4 = unsafe { get_table(self.mapper, self.root) };
        let pdpt_pa = self.ensure_entry(alloc, pml4, va.pml4_index(), "PDPT")?;
        let pdpt = unsafe { get_table(self.mapper, pdpt_pa) };
        let pd_pa = self.ensure_entry(alloc, pdpt, va.pdpt_index(), "PD")?;
        Ok(unsafe { get_table(self.mapper, pd_pa) })
    }

    /// Walk (and build) down to the PT for `va`.
    fn ensure_chain<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtAddr,
    ) -> Result<&mut PageTable, MapError> {
        let pd = self.ensure_pd(alloc, va)?;
        let pt_pa = self.ensure_entry(alloc, pd, va.pd_index(), "PT")?;
        Ok(unsafe { get_table(self.mapper, pt_pa) })
    }

    /// Return the table `table[index]` points at, allocating and linking a
    /// zeroed one when the slot is empty.
    fn ensure_entry<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        table: &mut PageTable,
        index: usize,
        what: &'static str,
    ) -> Result<PhysAddr, MapError> {
        let entry = table.entry(index);
        if entry.present() {
            debug_assert!(!entry.huge(), "huge leaf in the middle of a 4 KiB walk");
            return Ok(entry.frame());
        }
        let frame = alloc.alloc_4k().ok_or(MapError::OutOfMemory(what))?;
        unsafe { get_table(self.mapper, frame).zero() };
        table.set_entry(index, PageEntryBits::table(frame));
        Ok(frame)
    }
}
