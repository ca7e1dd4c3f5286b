/*!
Packed kernel archive (`.kpack`) format and its companion `.kpm` component
manifest.

A `.kpack` file carries the device code extracted from every bundled binary
of one build slice for one architecture family:

```text
offset 0  : "KPAK"            magic
offset 4  : format version    (u32, little-endian)
offset 8  : TOC offset        (u64, little-endian; backpatched at write time)
offset 16 : zero padding to a 64-byte boundary
          : compression blob  (layout owned by the compression scheme)
          : MessagePack TOC   (map keyed by binary path, then architecture)
```

Writing follows a map/reduce pattern: kernels are *prepared* concurrently
(the map phase, which does the per-kernel compression work), *added* under
the archive's lock in ordinal order, then *finalized* once to produce the
blob. Ordinals reflect the order kernels were added, not the order their
preparation finished.
*/

mod archive;
mod compress;
pub mod kpm;

mod error;

pub use archive::{pack_filename, ArchiveWriter, PackedArchive, PreparedKernel, TocEntry};
pub use compress::{
    Compression, CompressionInput, DEFAULT_ZSTD_LEVEL, SCHEME_NONE, SCHEME_ZSTD_PER_KERNEL,
};
pub use error::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Optional per-kernel metadata carried through the TOC untouched.
pub type KernelMetadata = std::collections::BTreeMap<String, String>;
