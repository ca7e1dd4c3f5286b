/*!
Access to Clang offload bundles embedded in HIP fat binaries.

Three layers cooperate here:

- [`toolchain`] locates and drives the external `clang-offload-bundler` and
  `objcopy` binaries (the happy path), and provides a native ELF section
  listing.
- [`ccob`] is an independent parser for the *compressed* offload bundle
  container. It exists because the bundler's own decompression path reads
  past the container's `total_size` and corrupts its input; this codec reads
  exactly the bytes the header declares.
- [`binary`] ties the two together: given a file, it detects whether device
  code is embedded, asks the bundler for the entries, and transparently
  falls back to the native codec when the bundler hits its known
  decompression bug.

[`marker`] reads and writes the `.rocm_kpack_ref` section the runtime uses
to locate the packed kernel archive for a host-only binary.
*/

pub mod binary;
pub mod ccob;
pub mod marker;
pub mod toolchain;

pub use binary::{BinaryKind, BundledBinary, GpuCodeObject};
pub use marker::KpackRefMarker;
pub use toolchain::Toolchain;

/// ELF section carrying the embedded offload bundle.
pub const HIP_FATBIN_SECTION: &str = ".hip_fatbin";

/// ELF section holding the runtime marker for packed binaries.
pub const MARKER_SECTION: &str = ".rocm_kpack_ref";
