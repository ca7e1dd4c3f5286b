use snafu::Snafu;
use std::io;
use std::path::PathBuf;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("kernel already exists for {relative_path} @ {gfx_arch}"))]
    Duplicate {
        relative_path: String,
        gfx_arch: String,
    },

    #[snafu(display("invalid archive state: {reason}"))]
    BadState { reason: String },

    #[snafu(display("invalid kpack magic {found:?} (expected \"KPAK\")"))]
    BadMagic { found: [u8; 4] },

    #[snafu(display("unsupported kpack format version {version}"))]
    UnsupportedVersion { version: u32 },

    #[snafu(display("unknown compression scheme '{scheme}'"))]
    UnknownScheme { scheme: String },

    #[snafu(display("compression scheme '{scheme}' requires TOC field '{field}'"))]
    MissingSchemeField {
        scheme: &'static str,
        field: &'static str,
    },

    #[snafu(display("kernel ordinal {ordinal} out of range (archive holds {count})"))]
    OrdinalOutOfRange { ordinal: u32, count: usize },

    #[snafu(display("compression blob truncated at offset {offset}"))]
    TruncatedBlob { offset: usize },

    #[snafu(display("failed to compress kernel '{kernel_id}': {source}"))]
    Compress {
        kernel_id: String,
        source: io::Error,
    },

    #[snafu(display("failed to decompress kernel ordinal {ordinal}: {source}"))]
    Decompress { ordinal: u32, source: io::Error },

    #[snafu(display("I/O error on '{}': {source}", path.display()))]
    Io { path: PathBuf, source: io::Error },

    #[snafu(display("failed to encode archive TOC: {source}"))]
    EncodeToc { source: rmp_serde::encode::Error },

    #[snafu(display("failed to decode archive TOC from '{}': {source}", path.display()))]
    DecodeToc {
        path: PathBuf,
        source: rmp_serde::decode::Error,
    },
}
