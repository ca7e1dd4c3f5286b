//! Fat-binary wrapper neutralization and the end-to-end host-only rewrite.

use crate::image::ElfImage;
use crate::{Error, Result, FATBIN_SEGMENT_SECTION, HIP_FATBIN_SECTION, KPACK_REF_SECTION};
use log::{debug, info};
use std::path::Path;

/// Magic of a live fat binary in the `__CudaFatBinaryWrapper` record.
const HIPF_MAGIC: u32 = 0x4849_5046;
/// Replacement magic telling the runtime the device code lives in a kpack.
const HIPK_MAGIC: u32 = 0x4B50_4948;

/// Statistics from [`kpack_offload_binary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewriteStats {
    pub removed_bytes: u64,
    pub marker_vaddr: u64,
    pub had_fatbin: bool,
}

impl ElfImage {
    /// Flip the `.hipFatBinSegment` wrapper magic from `HIPF` to `HIPK` and
    /// null the embedded device-code pointer. An already-neutralized wrapper
    /// is reported as [`Error::AlreadyNeutralized`] so callers can decide
    /// whether that is acceptable; any other magic is rejected.
    pub fn rewrite_fatbin_magic(&mut self) -> Result<()> {
        let (_, shdr) = self.require_section(FATBIN_SEGMENT_SECTION)?;
        let base = shdr.sh_offset as usize;
        let magic = self.read_u32(base)?;
        if magic == HIPK_MAGIC {
            return Err(Error::AlreadyNeutralized);
        }
        if magic != HIPF_MAGIC {
            return Err(Error::UnexpectedMagic { magic });
        }
        self.write_u32(base, HIPK_MAGIC)?;
        // The wrapper's device-code pointer dangles once the payload is gone.
        self.write_u64(base + 8, 0)?;
        Ok(())
    }
}

/// Rewrite a marked fat binary into its host-only form.
///
/// The input must already carry the (not yet allocated) `.rocm_kpack_ref`
/// section. The `.hip_fatbin` payload is removed and its space reclaimed, the
/// marker section is mapped into a new load segment so the runtime can find
/// it via `dl_iterate_phdr`, and the wrapper magic is flipped. Inputs without
/// a `.hip_fatbin` section skip removal and the magic flip but still get a
/// mapped marker.
pub fn kpack_offload_binary(input: &Path, output: &Path) -> Result<RewriteStats> {
    let mut image = ElfImage::from_path(input)?;

    let had_fatbin = image.find_section(HIP_FATBIN_SECTION)?.is_some();
    let removed_bytes = if had_fatbin {
        image.remove_section_payload(HIP_FATBIN_SECTION)?.size
    } else {
        debug!("{}: no {HIP_FATBIN_SECTION} section, nothing to remove", input.display());
        0
    };

    let marker_vaddr = image.map_section_to_new_load(KPACK_REF_SECTION, None)?;

    if had_fatbin {
        match image.rewrite_fatbin_magic() {
            Ok(()) => {}
            Err(Error::AlreadyNeutralized) => {
                debug!("{}: wrapper magic already neutralized", input.display());
            }
            Err(e) => return Err(e),
        }
    }

    image.write_to(output)?;
    info!(
        "{}: reclaimed {removed_bytes} bytes, marker mapped at {marker_vaddr:#x}",
        input.display()
    );

    Ok(RewriteStats {
        removed_bytes,
        marker_vaddr,
        had_fatbin,
    })
}
