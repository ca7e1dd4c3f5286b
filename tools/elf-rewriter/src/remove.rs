//! Removal of a section's payload with reclamation of its file and
//! virtual-address space.

use crate::image::{
    ElfImage, ProgramHeader, SectionHeader, DT_ADDR_TAGS, DT_NULL, DYN_SIZE, E_ENTRY, E_SHOFF,
    PHDR_SIZE, PT_DYNAMIC, REL_SIZE, RELA_SIZE, SHDR_SIZE, SHT_NULL, SHT_REL, SHT_RELA,
};
use crate::{Error, Result};
use log::debug;

/// Statistics from a successful payload removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovedSection {
    pub file_offset: u64,
    pub vaddr: u64,
    pub size: u64,
}

struct RemovalPlan {
    target_index: usize,
    removal_offset: u64,
    removal_vaddr: u64,
    removal_size: u64,
    /// Section indices whose file offset is strictly past the removed range.
    shifted_sections: Vec<usize>,
    phdrs: Vec<ProgramHeader>,
    shdrs: Vec<SectionHeader>,
    section_names: Vec<String>,
    old_shoff: u64,
    old_phoff: u64,
}

impl ElfImage {
    /// Remove a section's bytes from the image and re-pack everything that
    /// followed it, updating the ELF header, program headers, section
    /// headers, dynamic entries, relocations and GOT slots. The section
    /// header itself is retained but becomes `SHT_NULL` with zero size.
    pub fn remove_section_payload(&mut self, name: &str) -> Result<RemovedSection> {
        let plan = self.plan_removal(name)?;
        debug!(
            "removing {name}: offset={:#x} vaddr={:#x} size={:#x}",
            plan.removal_offset, plan.removal_vaddr, plan.removal_size
        );

        if plan.removal_size == 0 {
            return Ok(RemovedSection {
                file_offset: plan.removal_offset,
                vaddr: plan.removal_vaddr,
                size: 0,
            });
        }

        let start = plan.removal_offset as usize;
        let end = start + plan.removal_size as usize;
        if end > self.data.len() {
            return Err(Error::Truncated { offset: end });
        }
        self.data.drain(start..end);

        self.patch_elf_header(&plan)?;
        self.patch_program_headers(&plan)?;
        self.patch_section_headers(&plan)?;
        self.patch_dynamic_entries(&plan)?;
        self.patch_relocations(&plan)?;
        self.patch_got_slots(&plan)?;

        Ok(RemovedSection {
            file_offset: plan.removal_offset,
            vaddr: plan.removal_vaddr,
            size: plan.removal_size,
        })
    }

    fn plan_removal(&self, name: &str) -> Result<RemovalPlan> {
        let (target_index, target) = self.require_section(name)?;

        // The section must live in exactly one PT_LOAD; payloads outside any
        // load segment have no address space to reclaim.
        if target.sh_size > 0 && self.load_segment_covering(target.sh_addr)?.is_none() {
            return Err(Error::UnmappedAddress {
                vaddr: target.sh_addr,
            });
        }

        let shdrs: Vec<SectionHeader> = (0..self.shnum()? as usize)
            .map(|i| self.section_header(i))
            .collect::<Result<_>>()?;
        let section_names = shdrs
            .iter()
            .map(|s| self.section_name(s))
            .collect::<Result<Vec<_>>>()?;

        let shifted_sections = shdrs
            .iter()
            .enumerate()
            .filter(|(i, s)| {
                *i != target_index && s.sh_type != SHT_NULL && s.sh_offset > target.sh_offset
            })
            .map(|(i, _)| i)
            .collect();

        Ok(RemovalPlan {
            target_index,
            removal_offset: target.sh_offset,
            removal_vaddr: target.sh_addr,
            removal_size: target.sh_size,
            shifted_sections,
            phdrs: self.program_headers()?,
            shdrs,
            section_names,
            old_shoff: self.shoff()?,
            old_phoff: self.phoff()?,
        })
    }

    fn patch_elf_header(&mut self, plan: &RemovalPlan) -> Result<()> {
        let entry = self.read_u64(E_ENTRY)?;
        if entry >= plan.removal_vaddr {
            self.write_u64(E_ENTRY, entry - plan.removal_size)?;
        }
        if plan.old_shoff > plan.removal_offset {
            self.write_u64(E_SHOFF, plan.old_shoff - plan.removal_size)?;
        }
        Ok(())
    }

    fn patch_program_headers(&mut self, plan: &RemovalPlan) -> Result<()> {
        for (index, phdr) in plan.phdrs.iter().enumerate() {
            let mut updated = *phdr;
            if phdr.contains_offset(plan.removal_offset) {
                updated.p_filesz -= plan.removal_size;
                updated.p_memsz -= plan.removal_size;
            } else if phdr.p_offset > plan.removal_offset {
                updated.p_offset -= plan.removal_size;
                updated.p_vaddr -= plan.removal_size;
                updated.p_paddr -= plan.removal_size;
            }
            let base = plan.old_phoff as usize + index * PHDR_SIZE;
            self.write_program_header_at(base, &updated)?;
        }
        Ok(())
    }

    fn patch_section_headers(&mut self, plan: &RemovalPlan) -> Result<()> {
        let new_shoff = self.shoff()? as usize;
        for (index, shdr) in plan.shdrs.iter().enumerate() {
            let mut updated = *shdr;
            if index == plan.target_index {
                updated.sh_type = SHT_NULL;
                updated.sh_size = 0;
            } else if plan.shifted_sections.contains(&index) {
                updated.sh_offset -= plan.removal_size;
                if updated.sh_addr > 0 && updated.sh_addr >= plan.removal_vaddr {
                    updated.sh_addr -= plan.removal_size;
                }
            }
            self.write_section_header_at(new_shoff + index * SHDR_SIZE, &updated)?;
        }
        Ok(())
    }

    fn patch_dynamic_entries(&mut self, plan: &RemovalPlan) -> Result<()> {
        let Some(dynamic) = plan.phdrs.iter().find(|p| p.p_type == PT_DYNAMIC) else {
            return Ok(());
        };
        let mut offset = dynamic.p_offset;
        if dynamic.p_offset > plan.removal_offset && !dynamic.contains_offset(plan.removal_offset) {
            offset -= plan.removal_size;
        }

        let count = (dynamic.p_filesz / DYN_SIZE as u64) as usize;
        for i in 0..count {
            let base = offset as usize + i * DYN_SIZE;
            let tag = self.read_i64(base)?;
            if tag == DT_NULL {
                break;
            }
            if DT_ADDR_TAGS.contains(&tag) {
                let value = self.read_u64(base + 8)?;
                if value >= plan.removal_vaddr {
                    self.write_u64(base + 8, value - plan.removal_size)?;
                }
            }
        }
        Ok(())
    }

    fn patch_relocations(&mut self, plan: &RemovalPlan) -> Result<()> {
        let removal_end = plan.removal_vaddr + plan.removal_size;
        for (index, shdr) in plan.shdrs.iter().enumerate() {
            let is_rela = shdr.sh_type == SHT_RELA;
            if !is_rela && shdr.sh_type != SHT_REL {
                continue;
            }
            let entry_size = if is_rela { RELA_SIZE } else { REL_SIZE };
            let mut section_offset = shdr.sh_offset;
            if plan.shifted_sections.contains(&index) {
                section_offset -= plan.removal_size;
            }

            let count = (shdr.sh_size / entry_size as u64) as usize;
            for i in 0..count {
                let base = section_offset as usize + i * entry_size;
                let r_offset = self.read_u64(base)?;
                if r_offset >= plan.removal_vaddr {
                    self.write_u64(base, r_offset - plan.removal_size)?;
                }
                if is_rela {
                    // Addends pointing into the removed range stay untouched
                    // (there is nothing left to point at); addends landing at
                    // the exact end are conservatively left alone as well.
                    let r_addend = self.read_i64(base + 16)?;
                    if r_addend > removal_end as i64 {
                        self.write_i64(base + 16, r_addend - plan.removal_size as i64)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn patch_got_slots(&mut self, plan: &RemovalPlan) -> Result<()> {
        let removal_end = plan.removal_vaddr + plan.removal_size;
        for (index, shdr) in plan.shdrs.iter().enumerate() {
            let name = &plan.section_names[index];
            if name != ".got" && name != ".got.plt" {
                continue;
            }
            let mut section_offset = shdr.sh_offset;
            if plan.shifted_sections.contains(&index) {
                section_offset -= plan.removal_size;
            }

            let count = (shdr.sh_size / 8) as usize;
            for i in 0..count {
                let base = section_offset as usize + i * 8;
                let pointer = self.read_u64(base)?;
                if pointer != 0 && pointer >= removal_end {
                    self.write_u64(base, pointer - plan.removal_size)?;
                }
            }
        }
        Ok(())
    }
}
