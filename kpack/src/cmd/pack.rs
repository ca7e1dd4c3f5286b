use crate::recognize::RecognizerRegistry;
use crate::scan::ArtifactScanner;
use crate::visitor::PackVisitor;
use anyhow::{ensure, Context, Result};
use clap::{Parser, ValueEnum};
use kpack_archive::{Compression, DEFAULT_ZSTD_LEVEL};
use log::info;
use offload_bundle::Toolchain;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CompressionArg {
    /// Store kernels verbatim.
    None,
    /// Compress each kernel as an independent zstd frame.
    Zstd,
}

/// Pack an install tree: device code moves into a `.kpack` archive, bundled
/// binaries become host-only with a `.rocm_kpack_ref` marker, everything
/// else is copied verbatim.
#[derive(Debug, Parser)]
pub(crate) struct Pack {
    /// Input directory tree containing bundled binaries.
    #[arg(long)]
    input: PathBuf,

    /// Output directory for the packed tree.
    #[arg(long)]
    output: PathBuf,

    /// Group name for this build slice (e.g. 'blas', 'torch', 'rocm').
    #[arg(long = "group-name")]
    group_name: String,

    /// Architecture family identifier (e.g. 'gfx1100', 'gfx100X').
    #[arg(long = "gfx-arch-family")]
    gfx_arch_family: String,

    /// Comma-separated list of the architectures in the family.
    #[arg(long = "gfx-arches", value_delimiter = ',', required = true)]
    gfx_arches: Vec<String>,

    /// Compression scheme for the packed kernels.
    #[arg(long, value_enum, default_value_t = CompressionArg::None)]
    compression: CompressionArg,

    /// Worker threads for scanning and kernel preparation; 1 disables the
    /// pool. Defaults to the number of CPUs.
    #[arg(long)]
    jobs: Option<usize>,

    /// Scratch directory handed to child tools through TMPDIR.
    #[arg(long = "tmp-dir")]
    tmp_dir: Option<PathBuf>,

    /// Path to clang-offload-bundler (found on $PATH by default).
    #[arg(long = "clang-offload-bundler", env = "KPACK_CLANG_OFFLOAD_BUNDLER")]
    clang_offload_bundler: Option<PathBuf>,

    /// Path to objcopy (found on $PATH by default).
    #[arg(long, env = "KPACK_OBJCOPY")]
    objcopy: Option<PathBuf>,
}

impl Pack {
    pub(crate) fn run(&self) -> Result<()> {
        ensure!(
            self.input.is_dir(),
            "input path is not a directory: {}",
            self.input.display()
        );
        std::fs::create_dir_all(&self.output)
            .with_context(|| format!("creating output directory {}", self.output.display()))?;

        let toolchain =
            Toolchain::new(self.clang_offload_bundler.clone(), self.objcopy.clone())?
                .with_tmp_dir(self.tmp_dir.clone());
        let compression = match self.compression {
            CompressionArg::None => Compression::None,
            CompressionArg::Zstd => Compression::ZstdPerKernel {
                level: DEFAULT_ZSTD_LEVEL,
            },
        };

        info!(
            "packing {} -> {} (group {}, family {}, arches {})",
            self.input.display(),
            self.output.display(),
            self.group_name,
            self.gfx_arch_family,
            self.gfx_arches.join(",")
        );

        let registry = RecognizerRegistry::with_default_recognizers();
        let visitor = PackVisitor::new(
            &self.output,
            &self.group_name,
            &self.gfx_arch_family,
            self.gfx_arches.clone(),
            compression,
            toolchain.clone(),
        )?;

        let jobs = self.jobs.unwrap_or_else(num_cpus::get).max(1);
        let scanner = ArtifactScanner::new(&registry).with_toolchain(toolchain);
        if jobs > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(jobs)
                .build()
                .context("building worker pool")?;
            scanner
                .with_pool(&pool)
                .scan_tree(&self.input, &visitor)?;
        } else {
            scanner.scan_tree(&self.input, &visitor)?;
        }

        let summary = visitor.finish()?;
        info!(
            "packed {} kernels from {} bundled binaries ({} opaque files, {} kernel databases) into {}",
            summary.kernels,
            summary.bundled_binaries,
            summary.opaque_files,
            summary.kernel_databases,
            summary.kpack_path.display()
        );
        Ok(())
    }
}
