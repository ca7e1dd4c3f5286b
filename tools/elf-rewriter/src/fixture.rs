//! Synthetic ELF images for exercising the rewriting primitives.
//!
//! Builds a small position-independent image with the section inventory the
//! rewriter cares about: an embedded fat binary, its wrapper record, a
//! dynamic section, RELATIVE relocations, a GOT, and optionally a
//! non-allocated marker section. File offsets equal virtual addresses so the
//! loader congruence requirement holds by construction.

use crate::{FATBIN_SEGMENT_SECTION, HIP_FATBIN_SECTION, KPACK_REF_SECTION};

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const SHDR_SIZE: usize = 64;
const TEXT_SIZE: usize = 0x100;
const SEGMENT_SIZE: usize = 24;
const DYNSTR: &[u8; 16] = b"\0kpack-fixture\0\0";

const PT_PHDR: u32 = 6;
const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const SHT_PROGBITS: u32 = 1;
const SHT_STRTAB: u32 = 3;
const SHT_RELA: u32 = 4;
const SHT_DYNAMIC: u32 = 6;
const SHF_WRITE: u64 = 1;
const SHF_ALLOC: u64 = 2;
const SHF_EXECINSTR: u64 = 4;
const DT_STRTAB: i64 = 5;
const DT_RELA: i64 = 7;
const DT_RELASZ: i64 = 8;
const DT_RELAENT: i64 = 9;
const DYN_ENTRIES: usize = 5; // STRTAB, RELA, RELASZ, RELAENT, NULL
const R_X86_64_RELATIVE: u64 = 8;

/// Wrapper magic of a live fat binary ("HIPF" as a little-endian word).
pub const HIPF_MAGIC: u32 = 0x4849_5046;

/// A built image plus the addresses tests assert against.
pub struct Fixture {
    pub data: Vec<u8>,
    pub fatbin_vaddr: u64,
    pub fatbin_size: u64,
    pub segment_vaddr: u64,
    /// Address of the wrapper's device-code pointer (has a RELATIVE reloc).
    pub segment_ptr_vaddr: u64,
    pub text_vaddr: u64,
    pub dynstr_vaddr: u64,
    pub rela_vaddr: u64,
    pub got_vaddr: u64,
}

pub struct FixtureBuilder {
    fatbin: Vec<u8>,
    marker: Option<Vec<u8>>,
    elf_type: u16,
    tight_phdrs: bool,
}

impl Default for FixtureBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FixtureBuilder {
    pub fn new() -> Self {
        Self {
            fatbin: Vec::new(),
            marker: None,
            elf_type: 3, // ET_DYN
            tight_phdrs: false,
        }
    }

    /// Embed a `.hip_fatbin` payload (and the wrapper record that goes with it).
    pub fn fatbin(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.fatbin = payload.into();
        self
    }

    /// Attach a non-allocated `.rocm_kpack_ref` section.
    pub fn marker(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.marker = Some(payload.into());
        self
    }

    /// Build a fixed-position executable instead of a PIE.
    pub fn fixed_position(mut self) -> Self {
        self.elf_type = 2; // ET_EXEC
        self
    }

    /// Place the first section directly behind the program-header table so
    /// any growth forces the table to relocate.
    pub fn tight_phdrs(mut self) -> Self {
        self.tight_phdrs = true;
        self
    }

    pub fn build(self) -> Fixture {
        let has_fatbin = !self.fatbin.is_empty();
        let phnum = if has_fatbin { 5 } else { 4 };

        let phdr_end = EHDR_SIZE + phnum * PHDR_SIZE;
        let text_off = if self.tight_phdrs { phdr_end + 8 } else { 0x200 };
        assert!(text_off >= phdr_end, "program headers overlap .text");

        let fatbin_off = text_off + TEXT_SIZE;
        let segment_off = fatbin_off + self.fatbin.len();
        let segment_size = if has_fatbin { SEGMENT_SIZE } else { 0 };
        let dyn_off = align8(segment_off + segment_size);
        let dyn_size = DYN_ENTRIES * 16;
        let dynstr_off = dyn_off + dyn_size;
        let rela_off = dynstr_off + DYNSTR.len();
        let rela_count = if has_fatbin { 2 } else { 1 };
        let got_off = rela_off + rela_count * 24;
        let alloc_end = got_off + 3 * 8;
        let marker_off = alloc_end;
        let marker_len = self.marker.as_ref().map_or(0, Vec::len);

        let mut names = ShstrtabBuilder::new();
        let n_text = names.add(".text");
        let n_fatbin = names.add(HIP_FATBIN_SECTION);
        let n_segment = names.add(FATBIN_SEGMENT_SECTION);
        let n_dynamic = names.add(".dynamic");
        let n_dynstr = names.add(".dynstr");
        let n_rela = names.add(".rela.dyn");
        let n_got = names.add(".got");
        let n_marker = names.add(KPACK_REF_SECTION);
        let n_shstrtab = names.add(".shstrtab");
        let shstrtab = names.finish();

        let shstrtab_off = marker_off + marker_len;
        let shoff = align8(shstrtab_off + shstrtab.len());
        let shnum = 7 + if has_fatbin { 2 } else { 0 } + usize::from(self.marker.is_some());

        let mut data = vec![0u8; shoff + shnum * SHDR_SIZE];

        // ELF header.
        data[..4].copy_from_slice(b"\x7fELF");
        data[4] = 2; // ELFCLASS64
        data[5] = 1; // ELFDATA2LSB
        data[6] = 1; // EV_CURRENT
        put_u16(&mut data, 16, self.elf_type);
        put_u16(&mut data, 18, 62); // EM_X86_64
        put_u32(&mut data, 20, 1);
        put_u64(&mut data, 24, text_off as u64); // e_entry
        put_u64(&mut data, 32, EHDR_SIZE as u64); // e_phoff
        put_u64(&mut data, 40, shoff as u64); // e_shoff
        put_u16(&mut data, 52, EHDR_SIZE as u16);
        put_u16(&mut data, 54, PHDR_SIZE as u16);
        put_u16(&mut data, 56, phnum as u16);
        put_u16(&mut data, 58, SHDR_SIZE as u16);
        put_u16(&mut data, 60, shnum as u16);
        put_u16(&mut data, 62, (shnum - 1) as u16); // .shstrtab is last

        // Program headers. File offsets equal virtual addresses throughout.
        let mut phdrs: Vec<[u64; 7]> = Vec::new();
        let load0_end = if has_fatbin { fatbin_off } else { dyn_off };
        // [p_type|p_flags packed later] stored as (type, flags, off, vaddr, filesz, memsz, align)
        phdrs.push([PT_PHDR as u64, 4, EHDR_SIZE as u64, (phnum * PHDR_SIZE) as u64, 0, 0, 8]);
        phdrs.push([PT_LOAD as u64, 5, 0, load0_end as u64, 0, 0, 0x1000]);
        if has_fatbin {
            phdrs.push([
                PT_LOAD as u64,
                4,
                fatbin_off as u64,
                (dyn_off - fatbin_off) as u64,
                0,
                0,
                0x1000,
            ]);
        }
        phdrs.push([
            PT_LOAD as u64,
            6,
            dyn_off as u64,
            (alloc_end - dyn_off) as u64,
            0,
            0,
            0x1000,
        ]);
        phdrs.push([PT_DYNAMIC as u64, 6, dyn_off as u64, dyn_size as u64, 0, 0, 8]);

        for (i, p) in phdrs.iter().enumerate() {
            let base = EHDR_SIZE + i * PHDR_SIZE;
            put_u32(&mut data, base, p[0] as u32);
            put_u32(&mut data, base + 4, p[1] as u32);
            put_u64(&mut data, base + 8, p[2]); // p_offset
            put_u64(&mut data, base + 16, p[2]); // p_vaddr
            put_u64(&mut data, base + 24, p[2]); // p_paddr
            put_u64(&mut data, base + 32, p[3]); // p_filesz
            put_u64(&mut data, base + 40, p[3]); // p_memsz
            put_u64(&mut data, base + 48, p[6]); // p_align
        }

        // .text
        data[text_off..text_off + TEXT_SIZE].fill(0x90);

        // .hip_fatbin and the wrapper record.
        data[fatbin_off..fatbin_off + self.fatbin.len()].copy_from_slice(&self.fatbin);
        if has_fatbin {
            put_u32(&mut data, segment_off, HIPF_MAGIC);
            put_u32(&mut data, segment_off + 4, 1);
            put_u64(&mut data, segment_off + 8, fatbin_off as u64);
        }

        // .dynamic
        put_u64(&mut data, dyn_off, DT_STRTAB as u64);
        put_u64(&mut data, dyn_off + 8, dynstr_off as u64);
        put_u64(&mut data, dyn_off + 16, DT_RELA as u64);
        put_u64(&mut data, dyn_off + 24, rela_off as u64);
        put_u64(&mut data, dyn_off + 32, DT_RELASZ as u64);
        put_u64(&mut data, dyn_off + 40, (rela_count * 24) as u64);
        put_u64(&mut data, dyn_off + 48, DT_RELAENT as u64);
        put_u64(&mut data, dyn_off + 56, 24);
        // DT_NULL terminator is already zero.

        // .dynstr
        data[dynstr_off..dynstr_off + DYNSTR.len()].copy_from_slice(DYNSTR);

        // .rela.dyn
        let mut rela_cursor = rela_off;
        if has_fatbin {
            put_u64(&mut data, rela_cursor, segment_off as u64 + 8);
            put_u64(&mut data, rela_cursor + 8, R_X86_64_RELATIVE);
            put_u64(&mut data, rela_cursor + 16, fatbin_off as u64);
            rela_cursor += 24;
        }
        put_u64(&mut data, rela_cursor, got_off as u64 + 16);
        put_u64(&mut data, rela_cursor + 8, R_X86_64_RELATIVE);
        put_u64(&mut data, rela_cursor + 16, dynstr_off as u64);

        // .got: a null slot, a pointer below the fat binary, one above it.
        put_u64(&mut data, got_off + 8, text_off as u64 + 0x10);
        put_u64(&mut data, got_off + 16, dynstr_off as u64);

        if let Some(marker) = &self.marker {
            data[marker_off..marker_off + marker.len()].copy_from_slice(marker);
        }
        data[shstrtab_off..shstrtab_off + shstrtab.len()].copy_from_slice(&shstrtab);

        // Section headers: (name, type, flags, addr, offset, size, entsize)
        let mut shdrs: Vec<[u64; 7]> = vec![[0; 7]];
        shdrs.push([
            n_text,
            SHT_PROGBITS as u64,
            SHF_ALLOC | SHF_EXECINSTR,
            text_off as u64,
            text_off as u64,
            TEXT_SIZE as u64,
            0,
        ]);
        if has_fatbin {
            shdrs.push([
                n_fatbin,
                SHT_PROGBITS as u64,
                SHF_ALLOC,
                fatbin_off as u64,
                fatbin_off as u64,
                self.fatbin.len() as u64,
                0,
            ]);
            shdrs.push([
                n_segment,
                SHT_PROGBITS as u64,
                SHF_ALLOC | SHF_WRITE,
                segment_off as u64,
                segment_off as u64,
                SEGMENT_SIZE as u64,
                0,
            ]);
        }
        shdrs.push([
            n_dynamic,
            SHT_DYNAMIC as u64,
            SHF_ALLOC | SHF_WRITE,
            dyn_off as u64,
            dyn_off as u64,
            dyn_size as u64,
            16,
        ]);
        shdrs.push([
            n_dynstr,
            SHT_STRTAB as u64,
            SHF_ALLOC,
            dynstr_off as u64,
            dynstr_off as u64,
            DYNSTR.len() as u64,
            0,
        ]);
        shdrs.push([
            n_rela,
            SHT_RELA as u64,
            SHF_ALLOC,
            rela_off as u64,
            rela_off as u64,
            (rela_count * 24) as u64,
            24,
        ]);
        shdrs.push([
            n_got,
            SHT_PROGBITS as u64,
            SHF_ALLOC | SHF_WRITE,
            got_off as u64,
            got_off as u64,
            24,
            8,
        ]);
        if let Some(marker) = &self.marker {
            shdrs.push([
                n_marker,
                SHT_PROGBITS as u64,
                0,
                0,
                marker_off as u64,
                marker.len() as u64,
                0,
            ]);
        }
        shdrs.push([
            n_shstrtab,
            SHT_STRTAB as u64,
            0,
            0,
            shstrtab_off as u64,
            shstrtab.len() as u64,
            0,
        ]);
        assert_eq!(shdrs.len(), shnum);

        for (i, s) in shdrs.iter().enumerate() {
            let base = shoff + i * SHDR_SIZE;
            put_u32(&mut data, base, s[0] as u32);
            put_u32(&mut data, base + 4, s[1] as u32);
            put_u64(&mut data, base + 8, s[2]);
            put_u64(&mut data, base + 16, s[3]);
            put_u64(&mut data, base + 24, s[4]);
            put_u64(&mut data, base + 32, s[5]);
            put_u64(&mut data, base + 48, 8); // sh_addralign
            put_u64(&mut data, base + 56, s[6]);
        }

        Fixture {
            data,
            fatbin_vaddr: fatbin_off as u64,
            fatbin_size: self.fatbin.len() as u64,
            segment_vaddr: segment_off as u64,
            segment_ptr_vaddr: segment_off as u64 + 8,
            text_vaddr: text_off as u64,
            dynstr_vaddr: dynstr_off as u64,
            rela_vaddr: rela_off as u64,
            got_vaddr: got_off as u64,
        }
    }
}

struct ShstrtabBuilder {
    bytes: Vec<u8>,
}

impl ShstrtabBuilder {
    fn new() -> Self {
        Self { bytes: vec![0] }
    }

    fn add(&mut self, name: &str) -> u64 {
        let offset = self.bytes.len() as u64;
        self.bytes.extend_from_slice(name.as_bytes());
        self.bytes.push(0);
        offset
    }

    fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

fn align8(value: usize) -> usize {
    (value + 7) & !7
}

fn put_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}
