//! Adapter presenting a file's offload-bundle entries, whichever of the two
//! container shapes it uses.

use crate::toolchain::{self, is_decompression_bug, Toolchain};
use crate::{ccob, HIP_FATBIN_SECTION};
use log::debug;
use snafu::{OptionExt, ResultExt, Snafu};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(context(false), display("{source}"))]
    Toolchain { source: toolchain::Error },

    #[snafu(context(false), display("{source}"))]
    Ccob { source: ccob::Error },

    #[snafu(display("failed to read '{}': {source}", path.display()))]
    ReadBinary { path: PathBuf, source: io::Error },

    #[snafu(display("failed to create temporary directory: {source}"))]
    CreateTempDir { source: io::Error },

    #[snafu(display("target '{triple}' not found in bundle"))]
    TargetMissing { triple: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How the bundle is packaged in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryKind {
    /// The file itself is bundler-format input (a `.co` code object).
    Standalone,
    /// An ELF binary embedding the bundle in a `.hip_fatbin` section.
    Bundled,
}

/// A GPU entry extracted from a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuCodeObject {
    pub triple: String,
    pub gfx_arch: String,
    pub data: Vec<u8>,
}

/// GPU architecture from a bundler target triple: everything after the last
/// `--`, which keeps feature-qualified forms like `gfx942:xnack+` intact.
pub fn extract_architecture(target: &str) -> Option<&str> {
    target.rsplit_once("--").map(|(_, arch)| arch)
}

/// Whether the file is an ELF binary embedding device code. Non-ELF files
/// and ELF files without the fat-binary section are opaque to the pipeline.
pub fn is_bundled_binary(path: &Path) -> Result<bool> {
    let mut magic = [0u8; 4];
    let mut file = fs::File::open(path).context(ReadBinarySnafu { path })?;
    match file.read_exact(&mut magic) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
        Err(e) => return Err(Error::ReadBinary {
            path: path.to_path_buf(),
            source: e,
        }),
    }
    if &magic != b"\x7fELF" {
        return Ok(false);
    }
    match Toolchain::list_elf_sections(path) {
        Ok(sections) => Ok(sections.iter().any(|s| s == HIP_FATBIN_SECTION)),
        Err(e) => {
            // An ELF magic with an unparseable body is treated as opaque.
            debug!("{}: {e}; treating as opaque", path.display());
            Ok(false)
        }
    }
}

/// A file known to carry an offload bundle. Extraction goes through the
/// external bundler and transparently falls back to the native CCOB codec
/// when the bundler trips over its decompression bug.
///
/// The `.hip_fatbin` dump is created lazily, once, in a temporary directory
/// that is removed when the adapter is dropped.
pub struct BundledBinary {
    toolchain: Toolchain,
    path: PathBuf,
    kind: BinaryKind,
    dump_dir: Option<TempDir>,
}

impl BundledBinary {
    pub fn open(toolchain: Toolchain, path: &Path) -> Result<Self> {
        let kind = if is_bundled_binary(path)? {
            BinaryKind::Bundled
        } else {
            BinaryKind::Standalone
        };
        Ok(Self {
            toolchain,
            path: path.to_path_buf(),
            kind,
            dump_dir: None,
        })
    }

    pub fn kind(&self) -> BinaryKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The file to hand to the bundler: the file itself for standalone
    /// inputs, the dumped `.hip_fatbin` section otherwise.
    fn bundler_input(&mut self) -> Result<PathBuf> {
        match self.kind {
            BinaryKind::Standalone => Ok(self.path.clone()),
            BinaryKind::Bundled => {
                if self.dump_dir.is_none() {
                    self.dump_dir = Some(tempfile::tempdir().context(CreateTempDirSnafu)?);
                }
                let dir = self.dump_dir.as_ref().expect("dump dir created above");
                let fatbin = dir.path().join("fatbin.o");
                if !fatbin.exists() {
                    self.toolchain
                        .dump_section(&self.path, HIP_FATBIN_SECTION, &fatbin)?;
                }
                Ok(fatbin)
            }
        }
    }

    fn list_targets_of(&self, input: &Path) -> Result<Vec<String>> {
        match self.toolchain.list_targets(input) {
            Ok(targets) => Ok(targets),
            Err(toolchain::Error::BundlerFailed { stderr }) if is_decompression_bug(&stderr) => {
                debug!(
                    "{}: bundler hit its decompression bug, using native CCOB parser",
                    self.path.display()
                );
                let data = fs::read(input).context(ReadBinarySnafu { path: input })?;
                Ok(ccob::list_triples_in(&data)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// All target triples in the bundle, host entries included.
    pub fn list_targets(&mut self) -> Result<Vec<String>> {
        let input = self.bundler_input()?;
        self.list_targets_of(&input)
    }

    /// GPU architectures present in the bundle; host entries are filtered
    /// out by their triple prefix.
    pub fn list_bundles(&mut self) -> Result<Vec<String>> {
        Ok(self
            .list_targets()?
            .iter()
            .filter(|t| t.starts_with("hip"))
            .filter_map(|t| extract_architecture(t))
            .map(str::to_string)
            .collect())
    }

    /// Extract every GPU entry as `(triple, payload)`.
    pub fn gpu_code_objects(&mut self) -> Result<Vec<GpuCodeObject>> {
        let input = self.bundler_input()?;
        let gpu_targets: Vec<String> = self
            .list_targets_of(&input)?
            .into_iter()
            .filter(|t| t.starts_with("hip"))
            .collect();
        if gpu_targets.is_empty() {
            return Ok(Vec::new());
        }

        let extract_dir = tempfile::tempdir().context(CreateTempDirSnafu)?;
        let outputs: Vec<PathBuf> = (0..gpu_targets.len())
            .map(|i| extract_dir.path().join(format!("{i}.hsaco")))
            .collect();

        match self.toolchain.unbundle(&input, &gpu_targets, &outputs) {
            Ok(()) => gpu_targets
                .iter()
                .zip(&outputs)
                .map(|(triple, output)| {
                    let data = fs::read(output).context(ReadBinarySnafu { path: output })?;
                    Ok(code_object(triple, data))
                })
                .collect(),
            Err(toolchain::Error::BundlerFailed { stderr }) if is_decompression_bug(&stderr) => {
                debug!(
                    "{}: bundler hit its decompression bug, extracting with native CCOB parser",
                    self.path.display()
                );
                let bundle = ccob::parse_file(&input)?;
                gpu_targets
                    .iter()
                    .map(|triple| {
                        let data = bundle
                            .code_object(triple)
                            .context(TargetMissingSnafu { triple })?;
                        Ok(code_object(triple, data.to_vec()))
                    })
                    .collect()
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn code_object(triple: &str, data: Vec<u8>) -> GpuCodeObject {
    GpuCodeObject {
        triple: triple.to_string(),
        gfx_arch: extract_architecture(triple).unwrap_or(triple).to_string(),
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn architecture_extraction() {
        assert_eq!(
            extract_architecture("hipv4-amdgcn-amd-amdhsa--gfx1100"),
            Some("gfx1100")
        );
        assert_eq!(
            extract_architecture("hipv4-amdgcn-amd-amdhsa--gfx942:xnack+"),
            Some("gfx942:xnack+")
        );
        assert_eq!(extract_architecture("host-x86_64-unknown-linux-gnu--"), Some(""));
        assert_eq!(extract_architecture("no-separator"), None);
    }

    #[test]
    fn non_elf_files_are_not_bundled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readme.txt");
        fs::write(&path, b"just some text, definitely not device code").unwrap();
        assert!(!is_bundled_binary(&path).unwrap());

        let empty = dir.path().join("empty");
        fs::write(&empty, b"").unwrap();
        assert!(!is_bundled_binary(&empty).unwrap());
    }

    #[test]
    fn elf_without_fatbin_section_is_not_bundled() {
        // A minimal header-only ELF: no program headers, no sections.
        let mut data = vec![0u8; 64];
        data[..4].copy_from_slice(b"\x7fELF");
        data[4] = 2;
        data[5] = 1;
        data[6] = 1;
        data[16..18].copy_from_slice(&3u16.to_le_bytes()); // ET_DYN
        data[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        data[52..54].copy_from_slice(&64u16.to_le_bytes()); // e_ehsize

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.so");
        fs::write(&path, &data).unwrap();
        assert!(!is_bundled_binary(&path).unwrap());
    }
}
