use crate::addresses::PhysAddr;
use bitfield_struct::bitfield;

/// One 64-bit x86_64 page-table entry, the common superset of all four
/// levels (PML4E, PDPTE, PDE, PTE).
///
/// | bits  | field            | notes                                   |
/// |-------|------------------|-----------------------------------------|
/// | 0     | `present`        | entry is valid                           |
/// | 1     | `writable`       | write permission                         |
/// | 2     | `user`           | CPL 3 access (unused in this kernel)     |
/// | 3     | `write_through`  | write-through caching                    |
/// | 4     | `cache_disable`  | uncached; set for MMIO mappings          |
/// | 5     | `accessed`       | set by the CPU                           |
/// | 6     | `dirty`          | set by the CPU, leaves only              |
/// | 7     | `huge`           | PD leaf of 2 MiB (must be 0 in PML4/PT)  |
/// | 8     | `global`         | survives CR3 reload, leaves only         |
/// | 9-11  | OS available     | unused                                   |
/// | 12-51 | frame            | physical frame, low 12 bits implied zero |
/// | 52-58 | OS available     | unused                                   |
/// | 59-62 | `protection_key` | PKS key; checked against PKRS            |
/// | 63    | `no_execute`     | instruction fetch disallowed             |
///
/// The protection-key field is the load-bearing part of the single-address-
/// space design: every path that rewrites an entry goes through
/// [`PageEntryBits`] accessors, so the key bits survive unrelated flag
/// edits instead of being masked away by a hand-written constant.
#[bitfield(u64)]
pub struct PageEntryBits {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub huge: bool,
    pub global: bool,

    #[bits(3)]
    pub os_available_low: u8,

    /// Physical frame bits 51..12.
    #[bits(40)]
    frame_51_12: u64,

    #[bits(7)]
    pub os_available_high: u8,

    /// Supervisor protection key, bits 59..62.
    #[bits(4)]
    pub protection_key: u8,

    pub no_execute: bool,
}

impl PageEntryBits {
    /// Physical frame this entry points at (table base or mapped page).
    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysAddr {
        PhysAddr::new(self.frame_51_12() << 12)
    }

    /// Set the physical frame; `pa` must be 4 KiB aligned (2 MiB for huge
    /// leaves).
    #[inline]
    pub const fn set_frame(&mut self, pa: PhysAddr) {
        self.set_frame_51_12(pa.as_u64() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn with_frame(mut self, pa: PhysAddr) -> Self {
        self.set_frame(pa);
        self
    }

    /// Entry for a next-level table: present and writable, no key. Leaf
    /// permissions are the intersection over the walk, so intermediates
    /// stay permissive and all policy lives in the leaves.
    #[must_use]
    pub const fn table(next: PhysAddr) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_frame(next)
    }

    /// Leaf entry mapping `pa` with `flags` and `key`.
    #[must_use]
    pub fn leaf(pa: PhysAddr, flags: EntryFlags, key: ProtectionKey) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(flags.contains(EntryFlags::WRITABLE))
            .with_user(flags.contains(EntryFlags::USER))
            .with_write_through(flags.contains(EntryFlags::WRITE_THROUGH))
            .with_cache_disable(flags.contains(EntryFlags::CACHE_DISABLE))
            .with_global(flags.contains(EntryFlags::GLOBAL))
            .with_no_execute(flags.contains(EntryFlags::NO_EXECUTE))
            .with_protection_key(key.value())
            .with_frame(pa)
    }
}

bitflags::bitflags! {
    /// Caller-facing mapping flags. `PRESENT` is implied and the huge bit
    /// is chosen by the mapping operation, not the caller.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct EntryFlags: u64 {
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const GLOBAL        = 1 << 8;
        const NO_EXECUTE    = 1 << 63;
    }
}

/// A 4-bit supervisor protection key.
///
/// Key 0 is the kernel's own key and the PKRS reset value leaves every key
/// permissive, so a machine without PKS behaves identically.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProtectionKey(u8);

impl ProtectionKey {
    /// The key kernel-owned pages are tagged with.
    pub const KERNEL: Self = Self(0);

    /// Masks to the architectural 4 bits.
    #[must_use]
    pub const fn new(key: u8) -> Self {
        Self(key & 0xF)
    }

    #[must_use]
    pub const fn value(self) -> u8 {
        self.0
    }
}

/// One page table: 512 entries, 4 KiB, 4 KiB-aligned. Used for all four
/// levels of the hierarchy.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntryBits; 512],
}

impl PageTable {
    /// Mark every entry non-present.
    pub fn zero(&mut self) {
        self.entries = [PageEntryBits::new(); 512];
    }

    #[inline]
    #[must_use]
    pub fn entry(&self, index: usize) -> PageEntryBits {
        self.entries[index]
    }

    #[inline]
    pub fn set_entry(&mut self, index: usize, entry: PageEntryBits) {
        self.entries[index] = entry;
    }
}

const _: () = {
    assert!(core::mem::size_of::<PageTable>() == 4096);
    assert!(core::mem::align_of::<PageTable>() == 4096);
    assert!(core::mem::size_of::<PageEntryBits>() == 8);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_encoding_puts_every_bit_where_the_cpu_looks() {
        let e = PageEntryBits::leaf(
            PhysAddr::new(0x1234_5000),
            EntryFlags::WRITABLE | EntryFlags::CACHE_DISABLE | EntryFlags::NO_EXECUTE,
            ProtectionKey::new(0xA),
        );
        let raw = e.into_bits();
        assert_eq!(raw & 1, 1, "present");
        assert_eq!((raw >> 1) & 1, 1, "writable");
        assert_eq!((raw >> 4) & 1, 1, "cache disable");
        assert_eq!((raw >> 63) & 1, 1, "nx");
        assert_eq!((raw >> 59) & 0xF, 0xA, "protection key");
        assert_eq!(raw & 0x000F_FFFF_FFFF_F000, 0x1234_5000, "frame");
    }

    #[test]
    fn table_entries_carry_no_key_and_no_leaf_bits() {
        let e = PageEntryBits::table(PhysAddr::new(0x8000));
        assert!(e.present() && e.writable());
        assert!(!e.huge() && !e.global() && !e.no_execute());
        assert_eq!(e.protection_key(), 0);
        assert_eq!(e.frame().as_u64(), 0x8000);
    }

    #[test]
    fn protection_key_is_masked_to_four_bits() {
        assert_eq!(ProtectionKey::new(0x1F).value(), 0xF);
    }
}
