//! Pluggable compression for kernel payloads.
//!
//! Compressors are a closed sum type: the archive format only grows new
//! schemes by adding variants here and teaching the reader registry about
//! them. Each scheme splits its work into a thread-safe per-kernel *prepare*
//! step and a single-threaded *finalize* that lays out the blob.

use crate::error::{CompressSnafu, DecompressSnafu, IoSnafu, TruncatedBlobSnafu};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub const SCHEME_NONE: &str = "none";
pub const SCHEME_ZSTD_PER_KERNEL: &str = "zstd-per-kernel";

/// The zstd default level; a good balance of speed and ratio for kernels.
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Payloads stored verbatim; the TOC carries one `{offset, size}` blob
    /// reference per ordinal.
    None,
    /// Each kernel compressed as an independent zstd frame; the blob is a
    /// little-endian kernel count followed by `{frame_size, frame}` pairs in
    /// ordinal order.
    ZstdPerKernel { level: i32 },
}

impl Compression {
    pub fn scheme_name(&self) -> &'static str {
        match self {
            Compression::None => SCHEME_NONE,
            Compression::ZstdPerKernel { .. } => SCHEME_ZSTD_PER_KERNEL,
        }
    }

    /// Map phase: prepare one kernel. Safe to call from multiple workers on
    /// disjoint inputs; the zstd scheme constructs a fresh compressor per
    /// call since encoder state must not be shared across threads.
    pub(crate) fn prepare(&self, data: &[u8], kernel_id: &str) -> Result<CompressionInput> {
        let bytes = match self {
            Compression::None => data.to_vec(),
            Compression::ZstdPerKernel { level } => {
                zstd::bulk::compress(data, *level).context(CompressSnafu { kernel_id })?
            }
        };
        Ok(CompressionInput { bytes })
    }
}

/// Opaque result of the map phase, consumed by [`finalize_blob`].
#[derive(Debug)]
pub struct CompressionInput {
    bytes: Vec<u8>,
}

/// Blob reference for the `none` scheme. Offsets are relative to the blob
/// start when emitted by the reduce step; the archive writer rewrites them
/// to absolute file offsets once the blob position is known.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobRef {
    pub offset: u64,
    pub size: u32,
}

pub(crate) enum BlobMetadata {
    Blobs(Vec<BlobRef>),
    Zstd { size: u64 },
}

/// Reduce phase: lay out the blob from inputs in ordinal order.
pub(crate) fn finalize_blob(
    compression: Compression,
    inputs: &[CompressionInput],
) -> (Vec<u8>, BlobMetadata) {
    match compression {
        Compression::None => {
            let mut blob = Vec::new();
            let mut refs = Vec::with_capacity(inputs.len());
            for input in inputs {
                refs.push(BlobRef {
                    offset: blob.len() as u64,
                    size: input.bytes.len() as u32,
                });
                blob.extend_from_slice(&input.bytes);
            }
            (blob, BlobMetadata::Blobs(refs))
        }
        Compression::ZstdPerKernel { .. } => {
            let mut blob = Vec::new();
            blob.extend_from_slice(&(inputs.len() as u32).to_le_bytes());
            for input in inputs {
                blob.extend_from_slice(&(input.bytes.len() as u32).to_le_bytes());
                blob.extend_from_slice(&input.bytes);
            }
            let size = blob.len() as u64;
            (blob, BlobMetadata::Zstd { size })
        }
    }
}

/// Read-side compressor state. Holds a shared handle to the archive file;
/// the archive owns the reader, never the other way around.
pub(crate) enum CompressorReader {
    None {
        file: Arc<File>,
        blobs: Vec<BlobRef>,
    },
    Zstd(ZstdReader),
}

impl CompressorReader {
    pub(crate) fn decompress_kernel(&self, ordinal: u32, path: &Path) -> Result<Vec<u8>> {
        match self {
            CompressorReader::None { file, blobs } => {
                let blob = blobs.get(ordinal as usize).ok_or(Error::OrdinalOutOfRange {
                    ordinal,
                    count: blobs.len(),
                })?;
                let mut buf = vec![0u8; blob.size as usize];
                file.read_exact_at(&mut buf, blob.offset)
                    .context(IoSnafu { path })?;
                Ok(buf)
            }
            CompressorReader::Zstd(reader) => reader.decompress_kernel(ordinal, path),
        }
    }
}

pub(crate) struct ZstdReader {
    file: Arc<File>,
    blob_offset: u64,
    blob_size: u64,
    /// Uncompressed kernel sizes by ordinal, recovered from the TOC; used to
    /// bound the decoder's output buffer.
    original_sizes: Vec<u64>,
    state: Mutex<ZstdReaderState>,
}

struct ZstdReaderState {
    index: Option<ZstdIndex>,
    decoder: zstd::bulk::Decompressor<'static>,
}

struct ZstdIndex {
    blob: Vec<u8>,
    frames: Vec<(usize, usize)>,
}

impl ZstdReader {
    pub(crate) fn new(
        file: Arc<File>,
        blob_offset: u64,
        blob_size: u64,
        original_sizes: Vec<u64>,
        path: &Path,
    ) -> Result<Self> {
        let decoder = zstd::bulk::Decompressor::new().context(IoSnafu { path })?;
        Ok(Self {
            file,
            blob_offset,
            blob_size,
            original_sizes,
            state: Mutex::new(ZstdReaderState {
                index: None,
                decoder,
            }),
        })
    }

    fn decompress_kernel(&self, ordinal: u32, path: &Path) -> Result<Vec<u8>> {
        let mut state = self.state.lock().expect("zstd reader lock poisoned");
        if state.index.is_none() {
            state.index = Some(self.build_index(path)?);
        }

        let frame = {
            let index = state.index.as_ref().expect("index built above");
            let &(offset, size) =
                index
                    .frames
                    .get(ordinal as usize)
                    .ok_or(Error::OrdinalOutOfRange {
                        ordinal,
                        count: index.frames.len(),
                    })?;
            index.blob[offset..offset + size].to_vec()
        };
        let capacity = self
            .original_sizes
            .get(ordinal as usize)
            .copied()
            .unwrap_or(0) as usize;
        state
            .decoder
            .decompress(&frame, capacity)
            .context(DecompressSnafu { ordinal })
    }

    /// Read the blob once and build the ordinal → frame index.
    fn build_index(&self, path: &Path) -> Result<ZstdIndex> {
        let mut blob = vec![0u8; self.blob_size as usize];
        self.file
            .read_exact_at(&mut blob, self.blob_offset)
            .context(IoSnafu { path })?;

        ensure!(blob.len() >= 4, TruncatedBlobSnafu { offset: 0usize });
        let count = u32::from_le_bytes(blob[0..4].try_into().expect("4-byte slice")) as usize;

        let mut frames = Vec::with_capacity(count);
        let mut cursor = 4usize;
        for _ in 0..count {
            ensure!(
                cursor + 4 <= blob.len(),
                TruncatedBlobSnafu { offset: cursor }
            );
            let size =
                u32::from_le_bytes(blob[cursor..cursor + 4].try_into().expect("4-byte slice"))
                    as usize;
            cursor += 4;
            ensure!(
                cursor + size <= blob.len(),
                TruncatedBlobSnafu { offset: cursor }
            );
            frames.push((cursor, size));
            cursor += size;
        }
        Ok(ZstdIndex { blob, frames })
    }
}
