//! Pointer patching with relocation fixup.

use crate::image::{ElfImage, ET_DYN, RELA_SIZE, R_X86_64_RELATIVE, SHT_RELA};
use crate::{Error, Result};
use log::debug;

impl ElfImage {
    /// Write an 8-byte pointer at `pointer_vaddr` and update the matching
    /// `R_X86_64_RELATIVE` relocation so the loader re-applies the value at
    /// load time.
    ///
    /// Position-independent images (`ET_DYN`) require the relocation to
    /// exist: a pointer without one would never be fixed up, so its absence
    /// is a hard error. Fixed-position executables use absolute addressing
    /// and a missing relocation is tolerated.
    pub fn set_pointer(&mut self, pointer_vaddr: u64, target_vaddr: u64) -> Result<()> {
        let segment = self
            .load_segment_covering(pointer_vaddr)?
            .ok_or(Error::UnmappedAddress {
                vaddr: pointer_vaddr,
            })?;

        let file_offset = (segment.p_offset + (pointer_vaddr - segment.p_vaddr)) as usize;
        if file_offset + 8 > self.data.len() {
            return Err(Error::Truncated {
                offset: file_offset,
            });
        }
        self.write_u64(file_offset, target_vaddr)?;

        if self.update_relative_relocation(pointer_vaddr, target_vaddr as i64)? {
            return Ok(());
        }
        if self.elf_type()? == ET_DYN {
            return Err(Error::RelocationMissing {
                vaddr: pointer_vaddr,
            });
        }
        debug!("no relocation at {pointer_vaddr:#x}; fixed-position image, continuing");
        Ok(())
    }

    /// Find the `R_X86_64_RELATIVE` entry whose `r_offset` is `vaddr` and
    /// replace its addend. Returns whether an entry was updated.
    pub(crate) fn update_relative_relocation(
        &mut self,
        vaddr: u64,
        new_addend: i64,
    ) -> Result<bool> {
        for index in 0..self.shnum()? as usize {
            let shdr = self.section_header(index)?;
            if shdr.sh_type != SHT_RELA {
                continue;
            }
            let count = (shdr.sh_size / RELA_SIZE as u64) as usize;
            for i in 0..count {
                let base = shdr.sh_offset as usize + i * RELA_SIZE;
                if self.read_u64(base)? != vaddr {
                    continue;
                }
                let r_info = self.read_u64(base + 8)?;
                if r_info & 0xffff_ffff != R_X86_64_RELATIVE {
                    debug!(
                        "relocation at {vaddr:#x} has type {}, not R_X86_64_RELATIVE",
                        r_info & 0xffff_ffff
                    );
                    continue;
                }
                self.write_i64(base + 16, new_addend)?;
                return Ok(true);
            }
        }
        Ok(false)
    }
}
