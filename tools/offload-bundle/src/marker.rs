//! The `.rocm_kpack_ref` marker section.
//!
//! A MessagePack map the runtime reads at load time to locate the kpack
//! archive carrying a binary's device code. Search paths are relative to the
//! binary's own location; the kernel name is the binary's original
//! install-tree-relative path, used to index into the archive's TOC.

use crate::toolchain::{self, Toolchain};
use crate::MARKER_SECTION;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(context(false), display("{source}"))]
    Toolchain { source: toolchain::Error },

    #[snafu(display("failed to encode marker: {source}"))]
    Encode { source: rmp_serde::encode::Error },

    #[snafu(display("failed to decode marker from '{}': {source}", path.display()))]
    Decode {
        path: PathBuf,
        source: rmp_serde::decode::Error,
    },

    #[snafu(display("marker section of '{}' is out of the file's bounds", path.display()))]
    SectionOutOfBounds { path: PathBuf },

    #[snafu(display("failed to stage marker payload: {source}"))]
    StageMarker { source: io::Error },

    #[snafu(display("failed to read '{}': {source}", path.display()))]
    ReadBinary { path: PathBuf, source: io::Error },

    #[snafu(display("failed to parse ELF '{}': {source}", path.display()))]
    ParseElf {
        path: PathBuf,
        source: goblin::error::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KpackRefMarker {
    /// Kpack files to try, relative to the binary's own directory.
    pub kpack_search_paths: Vec<String>,
    /// TOC key: the binary's original tree-relative path, forward-slashed.
    pub kernel_name: String,
}

impl KpackRefMarker {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(self).context(EncodeSnafu)
    }

    pub fn from_bytes(bytes: &[u8], path: &Path) -> Result<Self> {
        rmp_serde::from_slice(bytes).context(DecodeSnafu { path })
    }
}

/// Attach the marker to `input`, writing the result to `output`. The section
/// is created non-allocated; the ELF rewriter later maps it into a load
/// segment.
pub fn add_marker(
    toolchain: &Toolchain,
    input: &Path,
    output: &Path,
    marker: &KpackRefMarker,
) -> Result<()> {
    let bytes = marker.to_bytes()?;
    let mut staged = tempfile::NamedTempFile::new().context(StageMarkerSnafu)?;
    staged.write_all(&bytes).context(StageMarkerSnafu)?;
    staged.flush().context(StageMarkerSnafu)?;
    toolchain.add_section(input, output, MARKER_SECTION, staged.path())?;
    Ok(())
}

/// Read the marker back from a binary; `None` when the section is absent.
pub fn read_marker(path: &Path) -> Result<Option<KpackRefMarker>> {
    let data = std::fs::read(path).context(ReadBinarySnafu { path })?;
    let elf = goblin::elf::Elf::parse(&data).context(ParseElfSnafu { path })?;

    let Some(section) = elf
        .section_headers
        .iter()
        .find(|sh| elf.shdr_strtab.get_at(sh.sh_name) == Some(MARKER_SECTION))
    else {
        return Ok(None);
    };

    let start = section.sh_offset as usize;
    let end = start + section.sh_size as usize;
    let payload = data
        .get(start..end)
        .ok_or_else(|| Error::SectionOutOfBounds {
            path: path.to_path_buf(),
        })?;
    KpackRefMarker::from_bytes(payload, path).map(Some)
}
