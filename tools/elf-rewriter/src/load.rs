//! Promotion of a non-allocated section to a fresh PT_LOAD segment, and
//! growth of the program-header table when a segment is appended.

use crate::image::{
    page_align_up, ElfImage, ProgramHeader, E_PHNUM, E_PHOFF, PAGE_SIZE, PF_R, PHDR_SIZE, PT_LOAD,
    PT_PHDR, SHF_ALLOC,
};
use crate::Result;
use log::debug;

/// Spare program-header slots allocated when the table has to move, so the
/// next few segment additions can grow it in place.
pub const PHDR_SPARE_SLOTS: usize = 16;

impl ElfImage {
    /// Map an existing section (typically freshly added and not yet
    /// allocated) into a new read-only `PT_LOAD` segment. Returns the
    /// virtual address the section was mapped at.
    ///
    /// The loader requires `p_offset ≡ p_vaddr (mod PAGE_SIZE)`; when the
    /// section's current file offset violates that, its bytes are re-appended
    /// at the end of the file with the necessary padding.
    pub fn map_section_to_new_load(&mut self, name: &str, vaddr: Option<u64>) -> Result<u64> {
        let (section_index, shdr) = self.require_section(name)?;
        let mut phdrs = self.program_headers()?;

        let new_vaddr = vaddr.unwrap_or_else(|| {
            let max_vaddr = phdrs
                .iter()
                .filter(|p| p.p_type == PT_LOAD)
                .map(|p| p.p_vaddr + p.p_memsz)
                .max()
                .unwrap_or(0);
            page_align_up(max_vaddr)
        });

        let vaddr_remainder = new_vaddr % PAGE_SIZE;
        let mut new_offset = shdr.sh_offset;
        if shdr.sh_offset % PAGE_SIZE != vaddr_remainder {
            let padding =
                (vaddr_remainder + PAGE_SIZE - self.data.len() as u64 % PAGE_SIZE) % PAGE_SIZE;
            self.data.extend(std::iter::repeat(0u8).take(padding as usize));
            new_offset = self.data.len() as u64;
            let start = shdr.sh_offset as usize;
            let payload = self.data[start..start + shdr.sh_size as usize].to_vec();
            self.data.extend_from_slice(&payload);
            debug!(
                "realigned {name} for mmap: offset {:#x} -> {:#x} ({} bytes padding)",
                shdr.sh_offset, new_offset, padding
            );
        }

        phdrs.push(ProgramHeader {
            p_type: PT_LOAD,
            p_flags: PF_R,
            p_offset: new_offset,
            p_vaddr: new_vaddr,
            p_paddr: new_vaddr,
            p_filesz: shdr.sh_size,
            p_memsz: shdr.sh_size,
            p_align: PAGE_SIZE,
        });

        let min_content_offset = self.min_content_offset_after_phdrs()?;
        self.resize_phdr_table(phdrs, min_content_offset)?;

        let mut updated = shdr;
        updated.sh_flags |= SHF_ALLOC;
        updated.sh_addr = new_vaddr;
        updated.sh_offset = new_offset;
        self.write_section_header(section_index, &updated)?;

        Ok(new_vaddr)
    }

    /// The smallest file offset of any section content past the current
    /// program-header table; the table may grow up to this point in place.
    fn min_content_offset_after_phdrs(&self) -> Result<u64> {
        let phdr_end = self.phoff()? + (self.phnum()? as u64) * PHDR_SIZE as u64;
        let mut min_offset = self.data.len() as u64;
        for index in 0..self.shnum()? as usize {
            let shdr = self.section_header(index)?;
            if shdr.sh_offset > phdr_end {
                min_offset = min_offset.min(shdr.sh_offset);
            }
        }
        Ok(min_offset)
    }

    /// Allocated capacity of the program-header table in slots. A previously
    /// relocated table sits in its own PT_LOAD (starting exactly at the
    /// table) whose file size records the over-allocation. A table at its
    /// original location is bounded by the content behind it, not by the
    /// segment that happens to cover it.
    fn phdr_capacity(&self) -> Result<usize> {
        let phoff = self.phoff()?;
        for phdr in self.program_headers()? {
            if phdr.p_type == PT_LOAD && phdr.p_offset == phoff && phdr.p_filesz > 0 {
                return Ok((phdr.p_filesz / PHDR_SIZE as u64) as usize);
            }
        }
        Ok(self.phnum()? as usize)
    }

    /// Rewrite the program-header table as `new_phdrs`, growing it in place
    /// when room allows and relocating it to the end of the file (with
    /// over-allocation and a covering PT_LOAD) otherwise. Returns the table's
    /// file offset.
    pub(crate) fn resize_phdr_table(
        &mut self,
        mut new_phdrs: Vec<ProgramHeader>,
        min_content_offset: u64,
    ) -> Result<u64> {
        let phoff = self.phoff()?;
        let new_table_bytes = (new_phdrs.len() * PHDR_SIZE) as u64;

        if new_table_bytes <= min_content_offset.saturating_sub(phoff) {
            debug!("writing {} program headers in place", new_phdrs.len());
            self.write_phdrs_at(phoff, &new_phdrs)?;
            self.write_u16(E_PHNUM, new_phdrs.len() as u16)?;
            return Ok(phoff);
        }

        let capacity = self.phdr_capacity()?;
        let spare = capacity.saturating_sub(self.phnum()? as usize);
        if spare > 0 && new_phdrs.len() <= capacity {
            debug!("using {spare} spare program-header slots");
            self.write_phdrs_at(phoff, &new_phdrs)?;
            self.write_u16(E_PHNUM, new_phdrs.len() as u16)?;
            return Ok(phoff);
        }

        // Relocate to the end of the file.
        let max_vaddr_end = new_phdrs
            .iter()
            .filter(|p| p.p_type == PT_LOAD)
            .map(|p| p.p_vaddr + p.p_memsz)
            .max()
            .unwrap_or(0);
        let table_vaddr = page_align_up(max_vaddr_end);

        let vaddr_remainder = table_vaddr % PAGE_SIZE;
        let offset_remainder = self.data.len() as u64 % PAGE_SIZE;
        if offset_remainder != vaddr_remainder {
            let padding = (vaddr_remainder + PAGE_SIZE - offset_remainder) % PAGE_SIZE;
            self.data.extend(std::iter::repeat(0u8).take(padding as usize));
        }
        let new_phoff = self.data.len() as u64;

        let final_count = new_phdrs.len() + 1; // plus the PT_LOAD covering the table
        let allocated_slots = final_count.div_ceil(PHDR_SPARE_SLOTS) * PHDR_SPARE_SLOTS;
        let allocated_bytes = (allocated_slots * PHDR_SIZE) as u64;
        debug!(
            "relocating program headers to {new_phoff:#x} ({allocated_slots} slots, {} spare)",
            allocated_slots - final_count
        );

        for phdr in new_phdrs.iter_mut() {
            if phdr.p_type == PT_PHDR {
                phdr.p_offset = new_phoff;
                phdr.p_vaddr = table_vaddr;
                phdr.p_paddr = table_vaddr;
                phdr.p_filesz = allocated_bytes;
                phdr.p_memsz = allocated_bytes;
            }
        }
        new_phdrs.push(ProgramHeader {
            p_type: PT_LOAD,
            p_flags: PF_R,
            p_offset: new_phoff,
            p_vaddr: table_vaddr,
            p_paddr: table_vaddr,
            p_filesz: allocated_bytes,
            p_memsz: allocated_bytes,
            p_align: PAGE_SIZE,
        });

        self.data
            .extend(std::iter::repeat(0u8).take(allocated_slots * PHDR_SIZE));
        self.write_phdrs_at(new_phoff, &new_phdrs)?;
        self.write_u64(E_PHOFF, new_phoff)?;
        self.write_u16(E_PHNUM, new_phdrs.len() as u16)?;

        Ok(new_phoff)
    }

    fn write_phdrs_at(&mut self, table_offset: u64, phdrs: &[ProgramHeader]) -> Result<()> {
        for (index, phdr) in phdrs.iter().enumerate() {
            self.write_program_header_at(table_offset as usize + index * PHDR_SIZE, phdr)?;
        }
        Ok(())
    }
}
