//! # Zero-copy ELF64 reader
//!
//! A bounds-checked view over an in-memory ELF image: header validation
//! plus program-header iteration, nothing else. No allocation, no section
//! headers, no relocation; the loader only needs `PT_LOAD` extents and the
//! entry point. Field decoding is explicit little-endian so the reader is
//! independent of the image's alignment in memory.

#![cfg_attr(not(any(test, doctest)), no_std)]

use bitfield_struct::bitfield;

/// Why an image was rejected.
///
/// The variants mirror the validation order: each check only runs when
/// everything before it passed, so a reported reason is the *first*
/// problem in the file.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ElfError {
    #[error("image shorter than an ELF64 header")]
    TooShort,
    #[error("bad magic, not an ELF image")]
    InvalidMagic,
    #[error("not a 64-bit image")]
    InvalidClass,
    #[error("not little-endian")]
    InvalidEndian,
    #[error("not an x86_64 image")]
    InvalidMachine,
    #[error("neither an executable nor a shared object")]
    InvalidType,
    #[error("malformed or out-of-bounds program header table")]
    InvalidProgramHeaders,
}

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const CLASS_64: u8 = 2;
const DATA_LITTLE_ENDIAN: u8 = 1;
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;
const EM_X86_64: u16 = 62;
const EHDR_LEN: usize = 64;
const PHDR_LEN: usize = 56;

/// The program-header type the loader acts on.
pub const PT_LOAD: u32 = 1;

/// `p_flags` of a program header: bit 0 execute, bit 1 write, bit 2 read.
#[bitfield(u32)]
pub struct SegmentFlags {
    pub execute: bool,
    pub write: bool,
    pub read: bool,
    #[bits(29)]
    __: u32,
}

/// Decoded ELF64 file header (the fields the loader consumes).
#[derive(Debug, Copy, Clone)]
pub struct FileHeader {
    pub kind: u16,
    pub machine: u16,
    pub entry: u64,
    ph_offset: u64,
    ph_entry_size: u16,
    ph_count: u16,
}

/// Decoded program header.
#[derive(Debug, Copy, Clone)]
pub struct ProgramHeader {
    pub kind: u32,
    pub flags: SegmentFlags,
    pub offset: u64,
    pub vaddr: u64,
    pub file_size: u64,
    pub mem_size: u64,
    pub align: u64,
}

#[inline]
fn le16(b: &[u8]) -> u16 {
    u16::from_le_bytes([b[0], b[1]])
}

#[inline]
fn le32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

#[inline]
fn le64(b: &[u8]) -> u64 {
    u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

/// A validated view over ELF bytes.
#[derive(Debug)]
pub struct ElfView<'a> {
    bytes: &'a [u8],
    header: FileHeader,
}

impl<'a> ElfView<'a> {
    /// Validate `bytes` and build the view.
    ///
    /// # Errors
    /// The first failed check, in the order of the [`ElfError`] variants.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ElfError> {
        if bytes.len() < EHDR_LEN {
            return Err(ElfError::TooShort);
        }
        if bytes[0..4] != ELF_MAGIC {
            return Err(ElfError::InvalidMagic);
        }
        if bytes[4] != CLASS_64 {
            return Err(ElfError::InvalidClass);
        }
        if bytes[5] != DATA_LITTLE_ENDIAN {
            return Err(ElfError::InvalidEndian);
        }

        let header = FileHeader {
            kind: le16(&bytes[16..18]),
            machine: le16(&bytes[18..20]),
            entry: le64(&bytes[24..32]),
            ph_offset: le64(&bytes[32..40]),
            ph_entry_size: le16(&bytes[54..56]),
            ph_count: le16(&bytes[56..58]),
        };

        if header.machine != EM_X86_64 {
            return Err(ElfError::InvalidMachine);
        }
        if header.kind != ET_EXEC && header.kind != ET_DYN {
            return Err(ElfError::InvalidType);
        }

        if (header.ph_entry_size as usize) < PHDR_LEN {
            return Err(ElfError::InvalidProgramHeaders);
        }
        let table_len = (header.ph_count as usize)
            .checked_mul(header.ph_entry_size as usize)
            .ok_or(ElfError::InvalidProgramHeaders)?;
        let table_end = (header.ph_offset as usize)
            .checked_add(table_len)
            .ok_or(ElfError::InvalidProgramHeaders)?;
        if table_end > bytes.len() {
            return Err(ElfError::InvalidProgramHeaders);
        }

        Ok(Self { bytes, header })
    }

    /// Program entry point as linked.
    #[must_use]
    pub const fn entry(&self) -> u64 {
        self.header.entry
    }

    /// The whole image.
    #[must_use]
    pub const fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Iterate all program headers.
    pub fn program_headers(&self) -> impl Iterator<Item = ProgramHeader> + '_ {
        let stride = self.header.ph_entry_size as usize;
        let offset = self.header.ph_offset as usize;
        (0..self.header.ph_count as usize).map(move |i| {
            let s = &self.bytes[offset + i * stride..offset + i * stride + PHDR_LEN];
            ProgramHeader {
                kind: le32(&s[0..4]),
                flags: SegmentFlags::from_bits(le32(&s[4..8])),
                offset: le64(&s[8..16]),
                vaddr: le64(&s[16..24]),
                file_size: le64(&s[32..40]),
                mem_size: le64(&s[40..48]),
                align: le64(&s[48..56]),
            }
        })
    }

    /// Iterate only the loadable segments.
    pub fn load_segments(&self) -> impl Iterator<Item = ProgramHeader> + '_ {
        self.program_headers().filter(|ph| ph.kind == PT_LOAD)
    }

    /// File bytes backing `ph` (`file_size` may be shorter than
    /// `mem_size`; the remainder is BSS the loader zeroes).
    #[must_use]
    pub fn segment_bytes(&self, ph: &ProgramHeader) -> Option<&'a [u8]> {
        let start = usize::try_from(ph.offset).ok()?;
        let len = usize::try_from(ph.file_size).ok()?;
        self.bytes.get(start..start.checked_add(len)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-assemble a minimal ELF64 image: header plus `phnum` PT_LOAD
    /// headers and some payload.
    fn sample_elf(phnum: u16) -> Vec<u8> {
        let mut b = vec![0u8; EHDR_LEN + phnum as usize * PHDR_LEN + 64];
        b[0..4].copy_from_slice(&ELF_MAGIC);
        b[4] = CLASS_64;
        b[5] = DATA_LITTLE_ENDIAN;
        b[6] = 1; // EV_CURRENT
        b[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        b[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        b[24..32].copy_from_slice(&0x40_1000u64.to_le_bytes()); // e_entry
        b[32..40].copy_from_slice(&(EHDR_LEN as u64).to_le_bytes()); // e_phoff
        b[54..56].copy_from_slice(&(PHDR_LEN as u16).to_le_bytes());
        b[56..58].copy_from_slice(&phnum.to_le_bytes());

        for i in 0..phnum as usize {
            let p = EHDR_LEN + i * PHDR_LEN;
            b[p..p + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
            b[p + 4..p + 8].copy_from_slice(&0b101u32.to_le_bytes()); // R+X
            let payload = (EHDR_LEN + phnum as usize * PHDR_LEN) as u64;
            b[p + 8..p + 16].copy_from_slice(&payload.to_le_bytes()); // p_offset
            b[p + 16..p + 24].copy_from_slice(&(0x40_1000u64 + i as u64 * 0x1000).to_le_bytes());
            b[p + 32..p + 40].copy_from_slice(&16u64.to_le_bytes()); // p_filesz
            b[p + 40..p + 48].copy_from_slice(&64u64.to_le_bytes()); // p_memsz
            b[p + 48..p + 56].copy_from_slice(&0x1000u64.to_le_bytes());
        }
        b
    }

    #[test]
    fn accepts_a_well_formed_image() {
        let bytes = sample_elf(2);
        let view = ElfView::parse(&bytes).expect("valid image");
        assert_eq!(view.entry(), 0x40_1000);

        let segs: Vec<_> = view.load_segments().collect();
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].vaddr, 0x40_1000);
        assert_eq!(segs[0].file_size, 16);
        assert_eq!(segs[0].mem_size, 64);
        assert!(segs[0].flags.read() && segs[0].flags.execute() && !segs[0].flags.write());
        assert_eq!(view.segment_bytes(&segs[0]).unwrap().len(), 16);
    }

    #[test]
    fn any_corrupt_magic_byte_is_invalid_magic() {
        for i in 0..4 {
            let mut bytes = sample_elf(1);
            bytes[i] ^= 0xFF;
            assert_eq!(ElfView::parse(&bytes).unwrap_err(), ElfError::InvalidMagic, "byte {i}");
        }
    }

    #[test]
    fn rejects_wrong_class_endian_machine_type() {
        let mut bytes = sample_elf(1);
        bytes[4] = 1; // ELFCLASS32
        assert_eq!(ElfView::parse(&bytes).unwrap_err(), ElfError::InvalidClass);

        let mut bytes = sample_elf(1);
        bytes[5] = 2; // big-endian
        assert_eq!(ElfView::parse(&bytes).unwrap_err(), ElfError::InvalidEndian);

        let mut bytes = sample_elf(1);
        bytes[18..20].copy_from_slice(&183u16.to_le_bytes()); // EM_AARCH64
        assert_eq!(ElfView::parse(&bytes).unwrap_err(), ElfError::InvalidMachine);

        let mut bytes = sample_elf(1);
        bytes[16..18].copy_from_slice(&1u16.to_le_bytes()); // ET_REL
        assert_eq!(ElfView::parse(&bytes).unwrap_err(), ElfError::InvalidType);
    }

    #[test]
    fn rejects_truncated_images() {
        assert_eq!(ElfView::parse(&[]).unwrap_err(), ElfError::TooShort);
        assert_eq!(ElfView::parse(&sample_elf(1)[..63]).unwrap_err(), ElfError::TooShort);

        // Header claims more program headers than the file holds.
        let mut bytes = sample_elf(1);
        bytes[56..58].copy_from_slice(&400u16.to_le_bytes());
        assert_eq!(
            ElfView::parse(&bytes).unwrap_err(),
            ElfError::InvalidProgramHeaders
        );
    }

    #[test]
    fn shared_objects_are_accepted() {
        let mut bytes = sample_elf(1);
        bytes[16..18].copy_from_slice(&ET_DYN.to_le_bytes());
        assert!(ElfView::parse(&bytes).is_ok());
    }
}
