use snafu::Snafu;
use std::io;
use std::path::PathBuf;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("not an ELF image (bad magic)"))]
    NotElf,

    #[snafu(display("only 64-bit ELF images are supported"))]
    NotElf64,

    #[snafu(display("only little-endian ELF images are supported"))]
    NotLittleEndian,

    #[snafu(display("ELF image truncated at offset {offset:#x}"))]
    Truncated { offset: usize },

    #[snafu(display("section '{name}' not found"))]
    SectionMissing { name: String },

    #[snafu(display("no PT_LOAD segment covers virtual address {vaddr:#x}"))]
    UnmappedAddress { vaddr: u64 },

    #[snafu(display(
        "PIE image has no R_X86_64_RELATIVE relocation for the pointer at {vaddr:#x}"
    ))]
    RelocationMissing { vaddr: u64 },

    #[snafu(display(
        "unexpected magic {magic:#010x} in {section} (expected the fat-binary wrapper magic)",
        section = crate::FATBIN_SEGMENT_SECTION
    ))]
    UnexpectedMagic { magic: u32 },

    #[snafu(display("fat-binary wrapper magic is already neutralized"))]
    AlreadyNeutralized,

    #[snafu(display("failed to read '{}': {source}", path.display()))]
    ReadInput { path: PathBuf, source: io::Error },

    #[snafu(display("failed to write '{}': {source}", path.display()))]
    WriteOutput { path: PathBuf, source: io::Error },
}
