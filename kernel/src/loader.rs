//! ELF program loader.
//!
//! Loads an in-memory ELF64 image into the shared address space: for each
//! `PT_LOAD` segment, back the page-aligned span with fresh physical
//! frames, map them writable under key 0, copy the file bytes and zero
//! the BSS tail. Returns the entry point for the caller to invoke with
//! the kernel-table pointer.
//!
//! Segment permission flags are parsed but not yet enforced; every
//! program page ends up read-write-execute. Tightening this is the
//! designated job of NX plus a per-program protection key.

use crate::{mem, vmem};
use kernel_abi::ProgramEntry;
use kernel_elf::{ElfError, ElfView};
use kernel_vmem::{EntryFlags, PAGE_SIZE, ProtectionKey, VirtAddr, align_down, align_up};
use log::{debug, info};

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Invalid(#[from] ElfError),
    /// Out of physical memory while backing a segment.
    #[error("failed to map a loadable segment")]
    LoadFailed,
}

/// Load `image` and return its entry point.
///
/// # Errors
/// Validation failures from `kernel-elf`, or [`LoadError::LoadFailed`]
/// when memory runs out mid-load (already mapped pages stay mapped; the
/// address space is shared and never torn down).
pub fn load(image: &[u8]) -> Result<ProgramEntry, LoadError> {
    let view = ElfView::parse(image)?;

    for segment in view.load_segments() {
        if segment.file_size > segment.mem_size {
            return Err(ElfError::InvalidProgramHeaders.into());
        }
        let start = align_down(segment.vaddr, PAGE_SIZE);
        let end = align_up(segment.vaddr + segment.mem_size, PAGE_SIZE);
        debug!(
            "segment {:#x}..{:#x} (file {:#x}, mem {:#x})",
            segment.vaddr,
            segment.vaddr + segment.mem_size,
            segment.file_size,
            segment.mem_size
        );

        let mut page = start;
        while page < end {
            let va = VirtAddr::new(page);
            // Adjacent segments may share an edge page that is already
            // backed.
            if vmem::query(va).is_none() {
                let frame = mem::alloc_frame().ok_or(LoadError::LoadFailed)?;
                vmem::map_page(va, frame, EntryFlags::WRITABLE, ProtectionKey::KERNEL)
                    .map_err(|_| LoadError::LoadFailed)?;
            }
            page += PAGE_SIZE;
        }

        let bytes = view.segment_bytes(&segment).ok_or(ElfError::InvalidProgramHeaders)?;
        unsafe {
            let dst = segment.vaddr as *mut u8;
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
            core::ptr::write_bytes(
                dst.add(bytes.len()),
                0,
                (segment.mem_size - segment.file_size) as usize,
            );
        }
    }

    info!("loaded program, entry {:#x}", view.entry());
    // The entry address is mapped and populated now; the signature is the
    // kernel-table contract.
    let entry = unsafe { core::mem::transmute::<u64, ProgramEntry>(view.entry()) };
    Ok(entry)
}
