/*!
In-place surgical edits to 64-bit little-endian ELF images.

This crate removes embedded device-code payloads from fat binaries and
reclaims their file and virtual-address space, promotes freshly added
sections to loadable segments so a runtime can discover them through
`dl_iterate_phdr`, and patches pointers together with their dynamic
relocations. Unlike `objcopy --remove-section`, removal here rewrites the
program headers, section headers, dynamic entries, relocations and GOT slots
so the output is a structurally valid, smaller binary.

All operations work on an [`ElfImage`] held in memory; outputs are written to
a sibling temporary file and renamed into place, preserving the input's mode
bits.
*/

mod error;
mod image;
mod load;
mod neutralize;
mod pointer;
mod remove;

#[doc(hidden)]
pub mod fixture;

pub use error::Error;
pub use image::{ElfImage, ProgramHeader, SectionHeader};
pub use neutralize::{kpack_offload_binary, RewriteStats};
pub use remove::RemovedSection;

/// Section carrying the embedded offload bundle in a fat binary.
pub const HIP_FATBIN_SECTION: &str = ".hip_fatbin";

/// Section holding the `__CudaFatBinaryWrapper` registration record.
pub const FATBIN_SEGMENT_SECTION: &str = ".hipFatBinSegment";

/// Marker section read by the runtime to locate packed kernel archives.
pub const KPACK_REF_SECTION: &str = ".rocm_kpack_ref";

pub type Result<T, E = Error> = std::result::Result<T, E>;
