//! KPAK archive writer and reader.

use crate::compress::{
    finalize_blob, BlobMetadata, BlobRef, Compression, CompressorReader, ZstdReader,
};
use crate::error::{DecodeTocSnafu, EncodeTocSnafu, IoSnafu};
use crate::{Error, KernelMetadata, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Arc, Mutex};

const MAGIC: &[u8; 4] = b"KPAK";
const FORMAT_VERSION: u32 = 1;
const HEADER_SIZE: u64 = 16;
const BLOB_ALIGNMENT: u64 = 64;

/// Standard archive filename for a build slice and architecture family.
pub fn pack_filename(group_name: &str, gfx_arch_family: &str) -> String {
    format!("{group_name}-{gfx_arch_family}.kpack")
}

/// TOC keys always use forward slashes, whatever the build host produced.
fn normalize_path(relative_path: &str) -> String {
    relative_path.replace('\\', "/")
}

/// Per-kernel TOC record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TocEntry {
    #[serde(rename = "type")]
    pub entry_type: String,
    /// Zero-based insertion index; the compressor's primary key.
    pub ordinal: u32,
    pub original_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<KernelMetadata>,
}

type Toc = BTreeMap<String, BTreeMap<String, TocEntry>>;

/// On-disk TOC shape. Scheme-specific fields live at the top level next to
/// the shared ones; absent fields are omitted from the MessagePack map.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct TocDocument {
    pub(crate) format_version: u32,
    pub(crate) group_name: String,
    pub(crate) gfx_arch_family: String,
    pub(crate) gfx_arches: Vec<String>,
    pub(crate) toc: Toc,
    pub(crate) compression_scheme: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) blobs: Option<Vec<BlobRef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) zstd_offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) zstd_size: Option<u64>,
}

/// Result of the concurrent prepare step, to be handed to
/// [`ArchiveWriter::add_kernel`].
#[derive(Debug)]
pub struct PreparedKernel {
    relative_path: String,
    gfx_arch: String,
    input: crate::compress::CompressionInput,
    kernel_id: String,
    original_size: u64,
    metadata: Option<KernelMetadata>,
}

struct Finalized {
    blob: Vec<u8>,
    metadata: BlobMetadata,
}

#[derive(Default)]
struct WriterState {
    toc: Toc,
    inputs: Vec<crate::compress::CompressionInput>,
    next_ordinal: u32,
    finalized: Option<Finalized>,
}

/// Write-side archive. The single mutex covers the ordinal counter, the TOC
/// map and the pending compression inputs; `prepare_kernel` stays lock-free
/// so workers can compress concurrently.
pub struct ArchiveWriter {
    group_name: String,
    gfx_arch_family: String,
    gfx_arches: Vec<String>,
    compression: Compression,
    state: Mutex<WriterState>,
}

impl ArchiveWriter {
    pub fn new(
        group_name: impl Into<String>,
        gfx_arch_family: impl Into<String>,
        gfx_arches: Vec<String>,
        compression: Compression,
    ) -> Self {
        Self {
            group_name: group_name.into(),
            gfx_arch_family: gfx_arch_family.into(),
            gfx_arches,
            compression,
            state: Mutex::new(WriterState::default()),
        }
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    pub fn gfx_arch_family(&self) -> &str {
        &self.gfx_arch_family
    }

    pub fn filename(&self) -> String {
        pack_filename(&self.group_name, &self.gfx_arch_family)
    }

    /// Map phase: compress one kernel. Callable from multiple threads at
    /// once; takes no lock.
    pub fn prepare_kernel(
        &self,
        relative_path: &str,
        gfx_arch: &str,
        data: &[u8],
        metadata: Option<KernelMetadata>,
    ) -> Result<PreparedKernel> {
        let relative_path = normalize_path(relative_path);
        let kernel_id = format!("{relative_path}@{gfx_arch}");
        let input = self.compression.prepare(data, &kernel_id)?;
        Ok(PreparedKernel {
            relative_path,
            gfx_arch: gfx_arch.to_string(),
            input,
            kernel_id,
            original_size: data.len() as u64,
            metadata,
        })
    }

    /// Serial phase: assign the next ordinal and record the kernel in the
    /// TOC. Rejects a second kernel for the same `(path, arch)` pair.
    pub fn add_kernel(&self, prepared: PreparedKernel) -> Result<()> {
        let mut state = self.state.lock().expect("archive state lock poisoned");
        ensure!(
            state.finalized.is_none(),
            crate::error::BadStateSnafu {
                reason: "add_kernel called after finalize",
            }
        );
        if let Some(arches) = state.toc.get(&prepared.relative_path) {
            ensure!(
                !arches.contains_key(&prepared.gfx_arch),
                crate::error::DuplicateSnafu {
                    relative_path: prepared.relative_path,
                    gfx_arch: prepared.gfx_arch,
                }
            );
        }

        let ordinal = state.next_ordinal;
        state.next_ordinal += 1;
        state.inputs.push(prepared.input);
        debug!("kernel {} assigned ordinal {ordinal}", prepared.kernel_id);
        state
            .toc
            .entry(prepared.relative_path)
            .or_default()
            .insert(
                prepared.gfx_arch,
                TocEntry {
                    entry_type: "hsaco".to_string(),
                    ordinal,
                    original_size: prepared.original_size,
                    metadata: prepared.metadata,
                },
            );
        Ok(())
    }

    /// Reduce phase: produce the blob from all prepared inputs. Must run
    /// with no preparation in flight, and only once.
    pub fn finalize(&self) -> Result<()> {
        let mut state = self.state.lock().expect("archive state lock poisoned");
        ensure!(
            state.finalized.is_none(),
            crate::error::BadStateSnafu {
                reason: "archive already finalized",
            }
        );
        let inputs = std::mem::take(&mut state.inputs);
        let (blob, metadata) = finalize_blob(self.compression, &inputs);
        state.finalized = Some(Finalized { blob, metadata });
        Ok(())
    }

    /// Emit the archive. `finalize` must have run first.
    pub fn write(&self, output_path: &Path) -> Result<()> {
        let state = self.state.lock().expect("archive state lock poisoned");
        let finalized = state.finalized.as_ref().ok_or_else(|| Error::BadState {
            reason: "write called before finalize".to_string(),
        })?;

        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent).context(IoSnafu { path: parent })?;
        }
        let mut file = File::create(output_path).context(IoSnafu { path: output_path })?;

        file.write_all(MAGIC).context(IoSnafu { path: output_path })?;
        file.write_all(&FORMAT_VERSION.to_le_bytes())
            .context(IoSnafu { path: output_path })?;
        file.write_all(&0u64.to_le_bytes())
            .context(IoSnafu { path: output_path })?;

        let padding = (BLOB_ALIGNMENT - HEADER_SIZE % BLOB_ALIGNMENT) % BLOB_ALIGNMENT;
        file.write_all(&vec![0u8; padding as usize])
            .context(IoSnafu { path: output_path })?;
        let blob_start = HEADER_SIZE + padding;

        file.write_all(&finalized.blob)
            .context(IoSnafu { path: output_path })?;
        let toc_offset = blob_start + finalized.blob.len() as u64;

        // Rewrite placeholder offsets now that the blob position is known.
        let (blobs, zstd_offset, zstd_size) = match &finalized.metadata {
            BlobMetadata::Blobs(refs) => {
                let absolute = refs
                    .iter()
                    .map(|r| BlobRef {
                        offset: r.offset + blob_start,
                        size: r.size,
                    })
                    .collect();
                (Some(absolute), None, None)
            }
            BlobMetadata::Zstd { size } => (None, Some(blob_start), Some(*size)),
        };

        let document = TocDocument {
            format_version: FORMAT_VERSION,
            group_name: self.group_name.clone(),
            gfx_arch_family: self.gfx_arch_family.clone(),
            gfx_arches: self.gfx_arches.clone(),
            toc: state.toc.clone(),
            compression_scheme: self.compression.scheme_name().to_string(),
            blobs,
            zstd_offset,
            zstd_size,
        };
        let toc_bytes = rmp_serde::to_vec_named(&document).context(EncodeTocSnafu)?;
        file.write_all(&toc_bytes)
            .context(IoSnafu { path: output_path })?;

        // Backpatch the TOC offset in the fixed header.
        file.seek(SeekFrom::Start(8))
            .context(IoSnafu { path: output_path })?;
        file.write_all(&toc_offset.to_le_bytes())
            .context(IoSnafu { path: output_path })?;

        debug!(
            "wrote {} ({} kernels, scheme {})",
            output_path.display(),
            state.next_ordinal,
            self.compression.scheme_name()
        );
        Ok(())
    }

    pub fn kernel_count(&self) -> usize {
        let state = self.state.lock().expect("archive state lock poisoned");
        state.next_ordinal as usize
    }

    /// Number of kernels recorded per architecture, for manifest entries.
    pub fn kernel_counts_by_arch(&self) -> BTreeMap<String, u64> {
        let state = self.state.lock().expect("archive state lock poisoned");
        let mut counts = BTreeMap::new();
        for arches in state.toc.values() {
            for arch in arches.keys() {
                *counts.entry(arch.clone()).or_insert(0u64) += 1;
            }
        }
        counts
    }
}

/// Read-side archive. Owns the compressor reader, which in turn holds a
/// shared handle to the open file.
pub struct PackedArchive {
    pub group_name: String,
    pub gfx_arch_family: String,
    pub gfx_arches: Vec<String>,
    toc: Toc,
    reader: CompressorReader,
    path: std::path::PathBuf,
}

impl PackedArchive {
    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path).context(IoSnafu { path })?;

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact_at(&mut header, 0)
            .context(IoSnafu { path })?;
        let found: [u8; 4] = header[0..4].try_into().expect("4-byte slice");
        ensure!(&found == MAGIC, crate::error::BadMagicSnafu { found });
        let version = u32::from_le_bytes(header[4..8].try_into().expect("4-byte slice"));
        ensure!(
            version == FORMAT_VERSION,
            crate::error::UnsupportedVersionSnafu { version }
        );
        let toc_offset = u64::from_le_bytes(header[8..16].try_into().expect("8-byte slice"));

        let file_len = file.metadata().context(IoSnafu { path })?.len();
        let mut toc_bytes = vec![0u8; file_len.saturating_sub(toc_offset) as usize];
        file.read_exact_at(&mut toc_bytes, toc_offset)
            .context(IoSnafu { path })?;
        let document: TocDocument =
            rmp_serde::from_slice(&toc_bytes).context(DecodeTocSnafu { path })?;

        let file = Arc::new(file);
        let reader = match document.compression_scheme.as_str() {
            SCHEME_NONE_STR => CompressorReader::None {
                file,
                blobs: document.blobs.ok_or(Error::MissingSchemeField {
                    scheme: SCHEME_NONE_STR,
                    field: "blobs",
                })?,
            },
            SCHEME_ZSTD_STR => {
                let blob_offset = document.zstd_offset.ok_or(Error::MissingSchemeField {
                    scheme: SCHEME_ZSTD_STR,
                    field: "zstd_offset",
                })?;
                let blob_size = document.zstd_size.ok_or(Error::MissingSchemeField {
                    scheme: SCHEME_ZSTD_STR,
                    field: "zstd_size",
                })?;
                let original_sizes = ordinal_sizes(&document.toc);
                CompressorReader::Zstd(ZstdReader::new(
                    file,
                    blob_offset,
                    blob_size,
                    original_sizes,
                    path,
                )?)
            }
            other => {
                return Err(Error::UnknownScheme {
                    scheme: other.to_string(),
                })
            }
        };

        Ok(Self {
            group_name: document.group_name,
            gfx_arch_family: document.gfx_arch_family,
            gfx_arches: document.gfx_arches,
            toc: document.toc,
            reader,
            path: path.to_path_buf(),
        })
    }

    /// Retrieve and decompress one kernel; `None` when the archive has no
    /// entry for the pair. Lookup keys normalize backslashes like writes do.
    pub fn get_kernel(&self, relative_path: &str, gfx_arch: &str) -> Result<Option<Vec<u8>>> {
        let key = normalize_path(relative_path);
        let Some(entry) = self.toc.get(&key).and_then(|a| a.get(gfx_arch)) else {
            return Ok(None);
        };
        self.reader
            .decompress_kernel(entry.ordinal, &self.path)
            .map(Some)
    }

    pub fn toc(&self) -> &BTreeMap<String, BTreeMap<String, TocEntry>> {
        &self.toc
    }

    pub fn kernel_count(&self) -> usize {
        self.toc.values().map(BTreeMap::len).sum()
    }
}

const SCHEME_NONE_STR: &str = crate::compress::SCHEME_NONE;
const SCHEME_ZSTD_STR: &str = crate::compress::SCHEME_ZSTD_PER_KERNEL;

/// Uncompressed kernel sizes indexed by ordinal.
fn ordinal_sizes(toc: &Toc) -> Vec<u64> {
    let count = toc.values().map(BTreeMap::len).sum();
    let mut sizes = vec![0u64; count];
    for arches in toc.values() {
        for entry in arches.values() {
            if let Some(slot) = sizes.get_mut(entry.ordinal as usize) {
                *slot = entry.original_size;
            }
        }
    }
    sizes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Compression;

    fn add(writer: &ArchiveWriter, path: &str, arch: &str, data: &[u8]) {
        let prepared = writer.prepare_kernel(path, arch, data, None).unwrap();
        writer.add_kernel(prepared).unwrap();
    }

    fn kernel1() -> Vec<u8> {
        let mut k = b"KERNEL1_GFX900_DATA".to_vec();
        k.extend(std::iter::repeat(0x00).take(100));
        k
    }

    fn kernel2() -> Vec<u8> {
        let mut k = b"KERNEL2_GFX906_DATA".to_vec();
        k.extend(std::iter::repeat(0x00).take(200));
        k
    }

    fn kernel3() -> Vec<u8> {
        let mut k = b"KERNEL3_APP_GFX900".to_vec();
        k.extend(std::iter::repeat(0xFF).take(150));
        k
    }

    #[test]
    fn uncompressed_roundtrip() {
        let writer = ArchiveWriter::new(
            "testlib",
            "gfx900X",
            vec!["gfx900".into(), "gfx906".into()],
            Compression::None,
        );
        add(&writer, "lib/libtest.so", "gfx900", &kernel1());
        add(&writer, "lib/libtest.so", "gfx906", &kernel2());
        add(&writer, "bin/testapp", "gfx900", &kernel3());
        writer.finalize().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(writer.filename());
        writer.write(&path).unwrap();

        // The blob begins at the mandatory 64-byte boundary.
        let raw = std::fs::read(&path).unwrap();
        assert_eq!(&raw[0..4], b"KPAK");
        // Ordinal 0 is the first kernel added, stored verbatim at the blob start.
        assert_eq!(&raw[64..64 + kernel1().len()], &kernel1()[..]);

        let archive = PackedArchive::read(&path).unwrap();
        assert_eq!(archive.group_name, "testlib");
        assert_eq!(archive.gfx_arch_family, "gfx900X");
        assert_eq!(archive.gfx_arches, vec!["gfx900", "gfx906"]);
        assert_eq!(archive.toc()["lib/libtest.so"].len(), 2);
        assert_eq!(archive.toc()["bin/testapp"].len(), 1);

        let ordinals: Vec<u32> = archive
            .toc()
            .values()
            .flat_map(|a| a.values().map(|e| e.ordinal))
            .collect();
        let mut sorted = ordinals.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1, 2], "ordinals must be dense");

        assert_eq!(
            archive.get_kernel("lib/libtest.so", "gfx900").unwrap(),
            Some(kernel1())
        );
        assert_eq!(
            archive.get_kernel("lib/libtest.so", "gfx906").unwrap(),
            Some(kernel2())
        );
        assert_eq!(
            archive.get_kernel("bin/testapp", "gfx900").unwrap(),
            Some(kernel3())
        );
        assert_eq!(archive.get_kernel("bin/testapp", "gfx906").unwrap(), None);
    }

    #[test]
    fn zstd_roundtrip_compresses() {
        let mk = |tag: &str| {
            let mut k = format!("HIP_KERNEL_{tag}_").into_bytes();
            k.extend(std::iter::repeat(b'A').take(500));
            k.extend(std::iter::repeat(b'B').take(500));
            k
        };
        let writer = ArchiveWriter::new(
            "testlib",
            "gfx110X",
            vec!["gfx1100".into(), "gfx1101".into()],
            Compression::ZstdPerKernel {
                level: crate::DEFAULT_ZSTD_LEVEL,
            },
        );
        let raw_total: usize = [mk("GFX1100"), mk("GFX1101"), mk("APP")]
            .iter()
            .map(Vec::len)
            .sum();
        add(&writer, "lib/libtest.so", "gfx1100", &mk("GFX1100"));
        add(&writer, "lib/libtest.so", "gfx1101", &mk("GFX1101"));
        add(&writer, "bin/testapp", "gfx1100", &mk("APP"));
        writer.finalize().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(writer.filename());
        writer.write(&path).unwrap();

        let written = std::fs::metadata(&path).unwrap().len() as usize;
        assert!(
            written < raw_total,
            "compressed archive ({written}) must beat raw input ({raw_total})"
        );

        let archive = PackedArchive::read(&path).unwrap();
        assert_eq!(
            archive.get_kernel("lib/libtest.so", "gfx1100").unwrap(),
            Some(mk("GFX1100"))
        );
        assert_eq!(
            archive.get_kernel("lib/libtest.so", "gfx1101").unwrap(),
            Some(mk("GFX1101"))
        );
        assert_eq!(
            archive.get_kernel("bin/testapp", "gfx1100").unwrap(),
            Some(mk("APP"))
        );
    }

    #[test]
    fn empty_archive_roundtrip() {
        let writer = ArchiveWriter::new("empty", "gfx900X", vec![], Compression::None);
        writer.finalize().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty-gfx900X.kpack");
        writer.write(&path).unwrap();

        let archive = PackedArchive::read(&path).unwrap();
        assert_eq!(archive.kernel_count(), 0);
        assert_eq!(archive.get_kernel("anything", "gfx900").unwrap(), None);
    }

    #[test]
    fn duplicate_kernel_rejected() {
        let writer = ArchiveWriter::new("g", "f", vec![], Compression::None);
        add(&writer, "lib/a.so", "gfx900", b"one");
        let dup = writer.prepare_kernel("lib/a.so", "gfx900", b"two", None).unwrap();
        assert!(matches!(
            writer.add_kernel(dup),
            Err(Error::Duplicate { .. })
        ));
    }

    #[test]
    fn backslash_paths_normalize_on_both_sides() {
        let writer = ArchiveWriter::new("g", "f", vec![], Compression::None);
        add(&writer, r"lib\win\thing.dll", "gfx900", b"data");
        writer.finalize().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("g-f.kpack");
        writer.write(&path).unwrap();

        let archive = PackedArchive::read(&path).unwrap();
        assert!(archive.toc().contains_key("lib/win/thing.dll"));
        assert_eq!(
            archive.get_kernel(r"lib\win\thing.dll", "gfx900").unwrap(),
            Some(b"data".to_vec())
        );
    }

    #[test]
    fn write_before_finalize_is_bad_state() {
        let writer = ArchiveWriter::new("g", "f", vec![], Compression::None);
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            writer.write(&dir.path().join("x.kpack")),
            Err(Error::BadState { .. })
        ));
    }

    #[test]
    fn finalize_twice_is_bad_state() {
        let writer = ArchiveWriter::new("g", "f", vec![], Compression::None);
        writer.finalize().unwrap();
        assert!(matches!(writer.finalize(), Err(Error::BadState { .. })));
    }

    #[test]
    fn add_after_finalize_is_bad_state() {
        let writer = ArchiveWriter::new("g", "f", vec![], Compression::None);
        let prepared = writer.prepare_kernel("a", "gfx900", b"x", None).unwrap();
        writer.finalize().unwrap();
        assert!(matches!(
            writer.add_kernel(prepared),
            Err(Error::BadState { .. })
        ));
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.kpack");
        std::fs::write(&path, b"NOPE\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00").unwrap();
        assert!(matches!(
            PackedArchive::read(&path),
            Err(Error::BadMagic { .. })
        ));

        let mut data = b"KPAK".to_vec();
        data.extend(9u32.to_le_bytes());
        data.extend(16u64.to_le_bytes());
        std::fs::write(&path, &data).unwrap();
        assert!(matches!(
            PackedArchive::read(&path),
            Err(Error::UnsupportedVersion { version: 9 })
        ));
    }

    #[test]
    fn rejects_unknown_compression_scheme() {
        let document = TocDocument {
            format_version: FORMAT_VERSION,
            group_name: "g".into(),
            gfx_arch_family: "f".into(),
            gfx_arches: vec![],
            toc: Toc::new(),
            compression_scheme: "lz77-sliding".into(),
            blobs: None,
            zstd_offset: None,
            zstd_size: None,
        };
        let toc_bytes = rmp_serde::to_vec_named(&document).unwrap();

        let mut data = Vec::new();
        data.extend_from_slice(MAGIC);
        data.extend(FORMAT_VERSION.to_le_bytes());
        data.extend((16u64).to_le_bytes());
        data.extend_from_slice(&toc_bytes);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weird.kpack");
        std::fs::write(&path, &data).unwrap();
        assert!(matches!(
            PackedArchive::read(&path),
            Err(Error::UnknownScheme { .. })
        ));
    }
}
