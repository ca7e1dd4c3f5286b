//! Validated mutable ELF image with little-endian field access.

use crate::error::{ReadInputSnafu, TruncatedSnafu, WriteOutputSnafu};
use crate::{Error, Result};
use scroll::{Pread, Pwrite, LE};
use snafu::{OptionExt, ResultExt};
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::NamedTempFile;

pub(crate) const PAGE_SIZE: u64 = 0x1000;

pub(crate) const EHDR_SIZE: usize = 64;
pub(crate) const PHDR_SIZE: usize = 56;
pub(crate) const SHDR_SIZE: usize = 64;
pub(crate) const DYN_SIZE: usize = 16;
pub(crate) const RELA_SIZE: usize = 24;
pub(crate) const REL_SIZE: usize = 16;

pub(crate) const E_TYPE: usize = 16;
pub(crate) const E_ENTRY: usize = 24;
pub(crate) const E_PHOFF: usize = 32;
pub(crate) const E_SHOFF: usize = 40;
pub(crate) const E_PHNUM: usize = 56;
pub(crate) const E_SHNUM: usize = 60;
pub(crate) const E_SHSTRNDX: usize = 62;

pub(crate) const ET_EXEC: u16 = 2;
pub(crate) const ET_DYN: u16 = 3;

pub(crate) const PT_LOAD: u32 = 1;
pub(crate) const PT_DYNAMIC: u32 = 2;
pub(crate) const PT_PHDR: u32 = 6;
pub(crate) const PF_R: u32 = 4;

pub(crate) const SHT_NULL: u32 = 0;
pub(crate) const SHT_RELA: u32 = 4;
pub(crate) const SHT_REL: u32 = 9;
pub(crate) const SHF_ALLOC: u64 = 0x2;

pub(crate) const R_X86_64_RELATIVE: u64 = 8;

pub(crate) const DT_NULL: i64 = 0;

/// Dynamic-section tags whose values are virtual addresses (as opposed to
/// sizes or flags) and therefore shift when address space is reclaimed.
pub(crate) const DT_ADDR_TAGS: [i64; 16] = [
    3,          // DT_PLTGOT
    4,          // DT_HASH
    5,          // DT_STRTAB
    6,          // DT_SYMTAB
    7,          // DT_RELA
    12,         // DT_INIT
    13,         // DT_FINI
    17,         // DT_REL
    23,         // DT_JMPREL
    25,         // DT_INIT_ARRAY
    26,         // DT_FINI_ARRAY
    32,         // DT_PREINIT_ARRAY
    34,         // DT_SYMTAB_SHNDX
    0x6ffffff0, // DT_VERSYM
    0x6ffffffc, // DT_VERDEF
    0x6ffffffe, // DT_VERNEED
];

pub(crate) fn page_align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

impl ProgramHeader {
    pub fn contains_offset(&self, offset: u64) -> bool {
        offset >= self.p_offset && offset < self.p_offset + self.p_filesz
    }

    pub fn contains_vaddr(&self, vaddr: u64) -> bool {
        vaddr >= self.p_vaddr && vaddr < self.p_vaddr + self.p_memsz
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SectionHeader {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
}

/// A 64-bit little-endian ELF image held in a mutable byte buffer.
///
/// Construction validates the identification bytes; everything else is read
/// on demand so that primitives always observe the current state of the
/// buffer, even after earlier primitives have moved things around.
pub struct ElfImage {
    pub(crate) data: Vec<u8>,
    mode: Option<u32>,
}

impl ElfImage {
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        snafu::ensure!(
            data.len() >= EHDR_SIZE && data.starts_with(b"\x7fELF"),
            crate::error::NotElfSnafu
        );
        snafu::ensure!(data[4] == 2, crate::error::NotElf64Snafu);
        snafu::ensure!(data[5] == 1, crate::error::NotLittleEndianSnafu);
        Ok(Self { data, mode: None })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let data = fs::read(path).context(ReadInputSnafu { path })?;
        let mode = fs::metadata(path)
            .context(ReadInputSnafu { path })?
            .permissions()
            .mode();
        let mut image = Self::from_bytes(data)?;
        image.mode = Some(mode);
        Ok(image)
    }

    /// Write the image next to `path` and rename it into place so partial
    /// outputs are never visible. Mode bits of the original input are
    /// restored when the image was read from a file.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        let mut tmp = match dir {
            Some(dir) => NamedTempFile::new_in(dir),
            None => NamedTempFile::new(),
        }
        .context(WriteOutputSnafu { path })?;
        tmp.write_all(&self.data).context(WriteOutputSnafu { path })?;
        tmp.persist(path)
            .map_err(|e| e.error)
            .context(WriteOutputSnafu { path })?;
        if let Some(mode) = self.mode {
            fs::set_permissions(path, fs::Permissions::from_mode(mode))
                .context(WriteOutputSnafu { path })?;
        }
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub(crate) fn read_u16(&self, offset: usize) -> Result<u16> {
        self.data
            .pread_with(offset, LE)
            .ok()
            .context(TruncatedSnafu { offset })
    }

    pub(crate) fn read_u32(&self, offset: usize) -> Result<u32> {
        self.data
            .pread_with(offset, LE)
            .ok()
            .context(TruncatedSnafu { offset })
    }

    pub(crate) fn read_u64(&self, offset: usize) -> Result<u64> {
        self.data
            .pread_with(offset, LE)
            .ok()
            .context(TruncatedSnafu { offset })
    }

    pub(crate) fn read_i64(&self, offset: usize) -> Result<i64> {
        self.data
            .pread_with(offset, LE)
            .ok()
            .context(TruncatedSnafu { offset })
    }

    pub(crate) fn write_u16(&mut self, offset: usize, value: u16) -> Result<()> {
        self.data
            .pwrite_with(value, offset, LE)
            .ok()
            .context(TruncatedSnafu { offset })?;
        Ok(())
    }

    pub(crate) fn write_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        self.data
            .pwrite_with(value, offset, LE)
            .ok()
            .context(TruncatedSnafu { offset })?;
        Ok(())
    }

    pub(crate) fn write_u64(&mut self, offset: usize, value: u64) -> Result<()> {
        self.data
            .pwrite_with(value, offset, LE)
            .ok()
            .context(TruncatedSnafu { offset })?;
        Ok(())
    }

    pub(crate) fn write_i64(&mut self, offset: usize, value: i64) -> Result<()> {
        self.data
            .pwrite_with(value, offset, LE)
            .ok()
            .context(TruncatedSnafu { offset })?;
        Ok(())
    }

    pub fn elf_type(&self) -> Result<u16> {
        self.read_u16(E_TYPE)
    }

    pub fn entry(&self) -> Result<u64> {
        self.read_u64(E_ENTRY)
    }

    pub fn phoff(&self) -> Result<u64> {
        self.read_u64(E_PHOFF)
    }

    pub fn shoff(&self) -> Result<u64> {
        self.read_u64(E_SHOFF)
    }

    pub fn phnum(&self) -> Result<u16> {
        self.read_u16(E_PHNUM)
    }

    pub fn shnum(&self) -> Result<u16> {
        self.read_u16(E_SHNUM)
    }

    pub fn shstrndx(&self) -> Result<u16> {
        self.read_u16(E_SHSTRNDX)
    }

    pub fn program_header(&self, index: usize) -> Result<ProgramHeader> {
        let base = self.phoff()? as usize + index * PHDR_SIZE;
        Ok(ProgramHeader {
            p_type: self.read_u32(base)?,
            p_flags: self.read_u32(base + 4)?,
            p_offset: self.read_u64(base + 8)?,
            p_vaddr: self.read_u64(base + 16)?,
            p_paddr: self.read_u64(base + 24)?,
            p_filesz: self.read_u64(base + 32)?,
            p_memsz: self.read_u64(base + 40)?,
            p_align: self.read_u64(base + 48)?,
        })
    }

    pub fn program_headers(&self) -> Result<Vec<ProgramHeader>> {
        (0..self.phnum()? as usize)
            .map(|i| self.program_header(i))
            .collect()
    }

    pub(crate) fn write_program_header_at(
        &mut self,
        offset: usize,
        phdr: &ProgramHeader,
    ) -> Result<()> {
        self.write_u32(offset, phdr.p_type)?;
        self.write_u32(offset + 4, phdr.p_flags)?;
        self.write_u64(offset + 8, phdr.p_offset)?;
        self.write_u64(offset + 16, phdr.p_vaddr)?;
        self.write_u64(offset + 24, phdr.p_paddr)?;
        self.write_u64(offset + 32, phdr.p_filesz)?;
        self.write_u64(offset + 40, phdr.p_memsz)?;
        self.write_u64(offset + 48, phdr.p_align)?;
        Ok(())
    }

    pub fn section_header(&self, index: usize) -> Result<SectionHeader> {
        self.section_header_at(self.shoff()? as usize + index * SHDR_SIZE)
    }

    pub(crate) fn section_header_at(&self, base: usize) -> Result<SectionHeader> {
        Ok(SectionHeader {
            sh_name: self.read_u32(base)?,
            sh_type: self.read_u32(base + 4)?,
            sh_flags: self.read_u64(base + 8)?,
            sh_addr: self.read_u64(base + 16)?,
            sh_offset: self.read_u64(base + 24)?,
            sh_size: self.read_u64(base + 32)?,
            sh_link: self.read_u32(base + 40)?,
            sh_info: self.read_u32(base + 44)?,
            sh_addralign: self.read_u64(base + 48)?,
            sh_entsize: self.read_u64(base + 56)?,
        })
    }

    pub(crate) fn write_section_header_at(
        &mut self,
        base: usize,
        shdr: &SectionHeader,
    ) -> Result<()> {
        self.write_u32(base, shdr.sh_name)?;
        self.write_u32(base + 4, shdr.sh_type)?;
        self.write_u64(base + 8, shdr.sh_flags)?;
        self.write_u64(base + 16, shdr.sh_addr)?;
        self.write_u64(base + 24, shdr.sh_offset)?;
        self.write_u64(base + 32, shdr.sh_size)?;
        self.write_u32(base + 40, shdr.sh_link)?;
        self.write_u32(base + 44, shdr.sh_info)?;
        self.write_u64(base + 48, shdr.sh_addralign)?;
        self.write_u64(base + 56, shdr.sh_entsize)?;
        Ok(())
    }

    pub(crate) fn write_section_header(&mut self, index: usize, shdr: &SectionHeader) -> Result<()> {
        let base = self.shoff()? as usize + index * SHDR_SIZE;
        self.write_section_header_at(base, shdr)
    }

    /// Resolve a section's name through the section-header string table.
    pub fn section_name(&self, shdr: &SectionHeader) -> Result<String> {
        let strtab = self.section_header(self.shstrndx()? as usize)?;
        let start = strtab.sh_offset as usize + shdr.sh_name as usize;
        let end = strtab.sh_offset as usize + strtab.sh_size as usize;
        if start >= end || end > self.data.len() {
            return Ok(String::new());
        }
        let bytes = &self.data[start..end];
        let nul = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..nul]).into_owned())
    }

    pub fn find_section(&self, name: &str) -> Result<Option<(usize, SectionHeader)>> {
        for index in 0..self.shnum()? as usize {
            let shdr = self.section_header(index)?;
            if self.section_name(&shdr)? == name {
                return Ok(Some((index, shdr)));
            }
        }
        Ok(None)
    }

    pub(crate) fn require_section(&self, name: &str) -> Result<(usize, SectionHeader)> {
        self.find_section(name)?
            .ok_or_else(|| Error::SectionMissing { name: name.into() })
    }

    /// The PT_LOAD whose memory image covers `vaddr`.
    pub(crate) fn load_segment_covering(&self, vaddr: u64) -> Result<Option<ProgramHeader>> {
        for phdr in self.program_headers()? {
            if phdr.p_type == PT_LOAD && phdr.contains_vaddr(vaddr) {
                return Ok(Some(phdr));
            }
        }
        Ok(None)
    }
}
