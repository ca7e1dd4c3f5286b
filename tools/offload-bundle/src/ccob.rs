//! Compressed Clang offload bundle (CCOB) codec.
//!
//! The container is a fixed header followed by a zstd-compressed payload
//! that inflates to an uncompressed bundle (magic, entry table, raw code
//! objects). The header's `total_size` bounds the compressed payload;
//! reading exactly `total_size - 32` bytes rather than to the end of the
//! buffer is the whole point of this codec, since bundles routinely travel
//! with trailing bytes that corrupt a naive decompression.

use snafu::{ensure, OptionExt, ResultExt, Snafu};
use std::io;
use std::path::{Path, PathBuf};

pub const CCOB_MAGIC: &[u8; 4] = b"CCOB";
pub const BUNDLE_MAGIC: &[u8] = b"__CLANG_OFFLOAD_BUNDLE__";

const CCOB_HEADER_SIZE: usize = 32;
const BUNDLE_HEADER_SIZE: usize = 32;
const ZSTD_METHOD: u16 = 1;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("CCOB header too short: {len} bytes (need {CCOB_HEADER_SIZE})"))]
    TruncatedHeader { len: usize },

    #[snafu(display("invalid CCOB magic"))]
    BadMagic,

    #[snafu(display("unsupported CCOB version {version}"))]
    UnsupportedVersion { version: u16 },

    #[snafu(display("unsupported CCOB compression method {method} (only zstd is supported)"))]
    UnsupportedCompression { method: u16 },

    #[snafu(display("CCOB data too short: {len} bytes, header declares {total_size}"))]
    DataTooShort { len: usize, total_size: u64 },

    #[snafu(display("CCOB decompression failed: {source}"))]
    DecompressFailed { source: io::Error },

    #[snafu(display("decompressed size mismatch: got {actual} bytes, header declares {expected}"))]
    SizeMismatch { actual: usize, expected: u64 },

    #[snafu(display("bundle too short: {len} bytes"))]
    BundleTooShort { len: usize },

    #[snafu(display("invalid offload bundle magic"))]
    BadBundleMagic,

    #[snafu(display("bundle entry {index} truncated at offset {offset}"))]
    TruncatedEntry { index: u64, offset: usize },

    #[snafu(display("failed to read '{}': {source}", path.display()))]
    ReadFile { path: PathBuf, source: io::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_le_bytes(data.get(offset..offset + 2)?.try_into().ok()?))
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    Some(u32::from_le_bytes(data.get(offset..offset + 4)?.try_into().ok()?))
}

fn read_u64(data: &[u8], offset: usize) -> Option<u64> {
    Some(u64::from_le_bytes(data.get(offset..offset + 8)?.try_into().ok()?))
}

/// Parsed CCOB container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CcobHeader {
    pub version: u16,
    pub compression_method: u16,
    /// Size of header plus compressed payload; bytes past this are noise.
    pub total_size: u64,
    pub uncompressed_size: u64,
    pub hash: u64,
}

impl CcobHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        ensure!(
            data.len() >= CCOB_HEADER_SIZE,
            TruncatedHeaderSnafu { len: data.len() }
        );
        ensure!(data.starts_with(CCOB_MAGIC), BadMagicSnafu);

        let version = read_u16(data, 4).context(TruncatedHeaderSnafu { len: data.len() })?;
        let compression_method =
            read_u16(data, 6).context(TruncatedHeaderSnafu { len: data.len() })?;

        // Version 3 carries 64-bit sizes; version 2 packs 32-bit sizes and is
        // padded out to the same 32-byte header.
        let (total_size, uncompressed_size, hash) = match version {
            3 => (
                read_u64(data, 8).context(TruncatedHeaderSnafu { len: data.len() })?,
                read_u64(data, 16).context(TruncatedHeaderSnafu { len: data.len() })?,
                read_u64(data, 24).context(TruncatedHeaderSnafu { len: data.len() })?,
            ),
            2 => (
                read_u32(data, 8).context(TruncatedHeaderSnafu { len: data.len() })? as u64,
                read_u32(data, 12).context(TruncatedHeaderSnafu { len: data.len() })? as u64,
                read_u64(data, 16).context(TruncatedHeaderSnafu { len: data.len() })?,
            ),
            other => return UnsupportedVersionSnafu { version: other }.fail(),
        };

        Ok(Self {
            version,
            compression_method,
            total_size,
            uncompressed_size,
            hash,
        })
    }
}

/// Decompress a CCOB container, reading exactly the bytes the header
/// declares and verifying the inflated size.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let header = CcobHeader::parse(data)?;
    ensure!(
        data.len() as u64 >= header.total_size,
        DataTooShortSnafu {
            len: data.len(),
            total_size: header.total_size,
        }
    );
    ensure!(
        header.compression_method == ZSTD_METHOD,
        UnsupportedCompressionSnafu {
            method: header.compression_method,
        }
    );

    let compressed = &data[CCOB_HEADER_SIZE..header.total_size as usize];
    let decompressed = zstd::stream::decode_all(compressed).context(DecompressFailedSnafu)?;
    ensure!(
        decompressed.len() as u64 == header.uncompressed_size,
        SizeMismatchSnafu {
            actual: decompressed.len(),
            expected: header.uncompressed_size,
        }
    );
    Ok(decompressed)
}

/// One entry of an uncompressed bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleEntry {
    pub offset: u64,
    pub size: u64,
    pub triple: String,
}

/// A parsed uncompressed offload bundle; owns the inflated bytes so entry
/// payloads can be sliced out on demand.
#[derive(Debug)]
pub struct UncompressedBundle {
    entries: Vec<BundleEntry>,
    data: Vec<u8>,
}

impl UncompressedBundle {
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        ensure!(
            data.len() >= BUNDLE_HEADER_SIZE,
            BundleTooShortSnafu { len: data.len() }
        );
        ensure!(data.starts_with(BUNDLE_MAGIC), BadBundleMagicSnafu);

        let num_entries = read_u64(&data, 24).context(BundleTooShortSnafu { len: data.len() })?;
        let mut entries = Vec::new();
        let mut pos = BUNDLE_HEADER_SIZE;

        for index in 0..num_entries {
            let offset = read_u64(&data, pos).context(TruncatedEntrySnafu { index, offset: pos })?;
            let size =
                read_u64(&data, pos + 8).context(TruncatedEntrySnafu { index, offset: pos })?;
            let triple_size =
                read_u64(&data, pos + 16).context(TruncatedEntrySnafu { index, offset: pos })?;
            pos += 24;

            let triple_bytes = data
                .get(pos..pos + triple_size as usize)
                .context(TruncatedEntrySnafu { index, offset: pos })?;
            let triple = String::from_utf8_lossy(triple_bytes).into_owned();
            pos += triple_size as usize;

            entries.push(BundleEntry {
                offset,
                size,
                triple,
            });
        }

        Ok(Self { entries, data })
    }

    pub fn entries(&self) -> &[BundleEntry] {
        &self.entries
    }

    pub fn list_triples(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.triple.clone()).collect()
    }

    /// Raw code object for a triple, or `None` when absent.
    pub fn code_object(&self, triple: &str) -> Option<&[u8]> {
        let entry = self.entries.iter().find(|e| e.triple == triple)?;
        self.data
            .get(entry.offset as usize..(entry.offset + entry.size) as usize)
    }
}

/// Read, decompress and parse a CCOB bundle file.
pub fn parse_file(path: &Path) -> Result<UncompressedBundle> {
    let data = std::fs::read(path).context(ReadFileSnafu { path })?;
    UncompressedBundle::parse(decompress(&data)?)
}

/// List the triples in an in-memory CCOB container.
pub fn list_triples_in(data: &[u8]) -> Result<Vec<String>> {
    Ok(UncompressedBundle::parse(decompress(data)?)?.list_triples())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Assemble an uncompressed bundle from `(triple, payload)` pairs.
    fn make_bundle(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut header_size = BUNDLE_HEADER_SIZE;
        for (triple, _) in entries {
            header_size += 24 + triple.len();
        }

        let mut data = Vec::new();
        data.extend_from_slice(BUNDLE_MAGIC);
        data.extend_from_slice(&(entries.len() as u64).to_le_bytes());

        let mut payload_offset = header_size as u64;
        for (triple, payload) in entries {
            data.extend_from_slice(&payload_offset.to_le_bytes());
            data.extend_from_slice(&(payload.len() as u64).to_le_bytes());
            data.extend_from_slice(&(triple.len() as u64).to_le_bytes());
            data.extend_from_slice(triple.as_bytes());
            payload_offset += payload.len() as u64;
        }
        for (_, payload) in entries {
            data.extend_from_slice(payload);
        }
        data
    }

    /// Wrap a bundle in a version-3 CCOB container.
    fn make_ccob(bundle: &[u8]) -> Vec<u8> {
        let compressed = zstd::stream::encode_all(bundle, 3).unwrap();
        let mut data = Vec::new();
        data.extend_from_slice(CCOB_MAGIC);
        data.extend_from_slice(&3u16.to_le_bytes());
        data.extend_from_slice(&ZSTD_METHOD.to_le_bytes());
        data.extend_from_slice(&((CCOB_HEADER_SIZE + compressed.len()) as u64).to_le_bytes());
        data.extend_from_slice(&(bundle.len() as u64).to_le_bytes());
        data.extend_from_slice(&0x1234_5678u64.to_le_bytes());
        data.extend_from_slice(&compressed);
        data
    }

    fn sample() -> Vec<u8> {
        make_bundle(&[
            ("host-x86_64-unknown-linux-gnu--", b"HOSTCODE".as_slice()),
            ("hipv4-amdgcn-amd-amdhsa--gfx1100", b"GFX1100-OBJECT".as_slice()),
            ("hipv4-amdgcn-amd-amdhsa--gfx942:xnack+", b"GFX942-OBJECT".as_slice()),
        ])
    }

    #[test]
    fn roundtrip_list_and_extract() {
        let ccob = make_ccob(&sample());
        let bundle = UncompressedBundle::parse(decompress(&ccob).unwrap()).unwrap();
        assert_eq!(
            bundle.list_triples(),
            vec![
                "host-x86_64-unknown-linux-gnu--",
                "hipv4-amdgcn-amd-amdhsa--gfx1100",
                "hipv4-amdgcn-amd-amdhsa--gfx942:xnack+",
            ]
        );
        assert_eq!(
            bundle.code_object("hipv4-amdgcn-amd-amdhsa--gfx1100"),
            Some(b"GFX1100-OBJECT".as_slice())
        );
        assert_eq!(bundle.code_object("hipv4-amdgcn-amd-amdhsa--gfx9999"), None);
    }

    #[test]
    fn trailing_garbage_does_not_corrupt_decompression() {
        // The canonical regression: the external bundler reads to the end of
        // the buffer instead of stopping at total_size.
        let bundle = sample();
        let mut ccob = make_ccob(&bundle);
        let clean = decompress(&ccob).unwrap();
        assert_eq!(clean.len(), bundle.len());

        ccob.extend_from_slice(b"TRAILING GARBAGE THAT IS NOT ZSTD");
        let with_garbage = decompress(&ccob).unwrap();
        assert_eq!(with_garbage, clean);
    }

    #[test]
    fn data_shorter_than_total_size_is_rejected() {
        let ccob = make_ccob(&sample());
        let truncated = &ccob[..ccob.len() - 1];
        assert!(matches!(
            decompress(truncated),
            Err(Error::DataTooShort { .. })
        ));
    }

    #[test]
    fn version_2_header_uses_narrow_sizes() {
        let bundle = sample();
        let compressed = zstd::stream::encode_all(bundle.as_slice(), 3).unwrap();
        let mut data = Vec::new();
        data.extend_from_slice(CCOB_MAGIC);
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&ZSTD_METHOD.to_le_bytes());
        data.extend_from_slice(&((CCOB_HEADER_SIZE + compressed.len()) as u32).to_le_bytes());
        data.extend_from_slice(&(bundle.len() as u32).to_le_bytes());
        data.extend_from_slice(&0u64.to_le_bytes());
        data.extend_from_slice(&[0u8; 8]); // pad header to 32 bytes
        data.extend_from_slice(&compressed);

        let header = CcobHeader::parse(&data).unwrap();
        assert_eq!(header.version, 2);
        assert_eq!(header.uncompressed_size, bundle.len() as u64);
        assert_eq!(decompress(&data).unwrap(), bundle);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut ccob = make_ccob(&sample());
        ccob[0] = b'X';
        assert!(matches!(CcobHeader::parse(&ccob), Err(Error::BadMagic)));
    }

    #[test]
    fn unsupported_method_is_rejected() {
        let mut ccob = make_ccob(&sample());
        ccob[6] = 7; // compression_method
        assert!(matches!(
            decompress(&ccob),
            Err(Error::UnsupportedCompression { method: 7 })
        ));
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let mut ccob = make_ccob(&sample());
        // Lie about the uncompressed size.
        let wrong = (sample().len() as u64 + 1).to_le_bytes();
        ccob[16..24].copy_from_slice(&wrong);
        assert!(matches!(decompress(&ccob), Err(Error::SizeMismatch { .. })));
    }

    #[test]
    fn truncated_entry_table_is_rejected() {
        let mut bundle = sample();
        // Claim one more entry than the table holds.
        bundle[24..32].copy_from_slice(&4u64.to_le_bytes());
        assert!(matches!(
            UncompressedBundle::parse(bundle),
            Err(Error::TruncatedEntry { .. })
        ));
    }
}
