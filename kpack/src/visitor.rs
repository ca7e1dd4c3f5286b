//! The map-phase visitor: copies opaque files, extracts kernels from bundled
//! binaries into a shared archive, rewrites host binaries, and installs
//! runtime markers.

use crate::artifact::copy_preserving;
use crate::recognize::KernelDatabase;
use crate::scan::{ArtifactPath, ArtifactVisitor};
use anyhow::{Context, Result};
use kpack_archive::kpm::{KpackFileEntry, PackManifest};
use kpack_archive::{pack_filename, ArchiveWriter, Compression};
use log::{debug, info};
use offload_bundle::binary::BundledBinary;
use offload_bundle::marker::{add_marker, KpackRefMarker};
use offload_bundle::Toolchain;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use walkdir::WalkDir;

/// Relative paths visited so far, for reporting. Guarded by its own lock so
/// statistics never contend with archive work.
#[derive(Debug, Default)]
struct Visited {
    opaque_files: Vec<PathBuf>,
    bundled_binaries: Vec<PathBuf>,
    kernel_databases: Vec<PathBuf>,
}

/// What a finished pack run produced.
#[derive(Debug)]
pub(crate) struct PackSummary {
    pub(crate) opaque_files: usize,
    pub(crate) bundled_binaries: usize,
    pub(crate) kernel_databases: usize,
    pub(crate) kernels: usize,
    pub(crate) kpack_path: PathBuf,
}

/// Thread-safe: every hook may be called concurrently. The archive guards
/// its own state; this type only adds the statistics lock.
pub(crate) struct PackVisitor {
    output_root: PathBuf,
    group_name: String,
    toolchain: Toolchain,
    kpack_filename: String,
    archive: ArchiveWriter,
    visited: Mutex<Visited>,
}

impl PackVisitor {
    pub(crate) fn new(
        output_root: &Path,
        group_name: &str,
        gfx_arch_family: &str,
        gfx_arches: Vec<String>,
        compression: Compression,
        toolchain: Toolchain,
    ) -> Result<Self> {
        fs::create_dir_all(output_root.join(".kpack"))
            .with_context(|| format!("creating {}", output_root.join(".kpack").display()))?;
        Ok(Self {
            output_root: output_root.to_path_buf(),
            group_name: group_name.to_string(),
            toolchain,
            kpack_filename: pack_filename(group_name, gfx_arch_family),
            archive: ArchiveWriter::new(group_name, gfx_arch_family, gfx_arches, compression),
            visited: Mutex::new(Visited::default()),
        })
    }

    /// Finalize the shared archive, write it under `.kpack/`, and emit the
    /// component manifest when any device code was collected.
    pub(crate) fn finish(self) -> Result<PackSummary> {
        self.archive.finalize()?;
        let kpack_path = self.output_root.join(".kpack").join(&self.kpack_filename);
        self.archive
            .write(&kpack_path)
            .with_context(|| format!("writing {}", kpack_path.display()))?;

        let counts = self.archive.kernel_counts_by_arch();
        if !counts.is_empty() {
            let size = fs::metadata(&kpack_path)
                .with_context(|| format!("reading size of {}", kpack_path.display()))?
                .len();
            let mut manifest = PackManifest::new(&self.group_name, "");
            for (arch, kernel_count) in counts {
                manifest.kpack_files.insert(
                    arch,
                    KpackFileEntry {
                        file: self.kpack_filename.clone(),
                        size,
                        kernel_count,
                    },
                );
            }
            let kpm_path = self
                .output_root
                .join(".kpack")
                .join(format!("{}.kpm", self.group_name));
            manifest.to_file(&kpm_path)?;
        }

        let visited = self.visited.into_inner().expect("statistics lock poisoned");
        Ok(PackSummary {
            opaque_files: visited.opaque_files.len(),
            bundled_binaries: visited.bundled_binaries.len(),
            kernel_databases: visited.kernel_databases.len(),
            kernels: self.archive.kernel_count(),
            kpack_path,
        })
    }

    fn kernel_name(artifact: &ArtifactPath) -> String {
        artifact.relative.to_string_lossy().replace('\\', "/")
    }

    /// `kpack_search_paths` entry for a binary at the given tree depth:
    /// enough `../` components to climb back to the output root, then the
    /// archive under `.kpack/`.
    fn search_path_for(&self, artifact: &ArtifactPath) -> String {
        let depth = artifact
            .relative
            .parent()
            .map(|p| p.components().count())
            .unwrap_or(0);
        format!("{}{}/{}", "../".repeat(depth), ".kpack", self.kpack_filename)
    }
}

impl ArtifactVisitor for PackVisitor {
    fn visit_opaque_file(&self, artifact: &ArtifactPath) -> Result<()> {
        self.visited
            .lock()
            .expect("statistics lock poisoned")
            .opaque_files
            .push(artifact.relative.clone());
        copy_preserving(&artifact.absolute(), &self.output_root.join(&artifact.relative))
    }

    fn visit_bundled_binary(
        &self,
        artifact: &ArtifactPath,
        mut binary: BundledBinary,
    ) -> Result<()> {
        self.visited
            .lock()
            .expect("statistics lock poisoned")
            .bundled_binaries
            .push(artifact.relative.clone());

        let kernel_name = Self::kernel_name(artifact);
        let objects = binary
            .gpu_code_objects()
            .with_context(|| format!("extracting kernels from {kernel_name}"))?;
        debug!("{kernel_name}: {} GPU code objects", objects.len());

        // Preparation stays on this worker: the scanner already saturates
        // the pool with per-path tasks, and nested submission would deadlock.
        // add_kernel serializes on the archive's own lock.
        for object in &objects {
            let prepared =
                self.archive
                    .prepare_kernel(&kernel_name, &object.gfx_arch, &object.data, None)?;
            self.archive.add_kernel(prepared)?;
        }

        // Host-only rewrite: attach the marker to a staging copy, then
        // remove the payload and map the marker in one pass.
        let marker = KpackRefMarker {
            kpack_search_paths: vec![self.search_path_for(artifact)],
            kernel_name: kernel_name.clone(),
        };
        let staging = tempfile::tempdir().context("creating staging directory")?;
        let file_name = artifact
            .relative
            .file_name()
            .with_context(|| format!("binary path {kernel_name} has no file name"))?;
        let marked = staging.path().join(file_name);
        add_marker(&self.toolchain, &artifact.absolute(), &marked, &marker)
            .with_context(|| format!("adding marker to {kernel_name}"))?;

        let dest = self.output_root.join(&artifact.relative);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
        elf_rewriter::kpack_offload_binary(&marked, &dest)
            .with_context(|| format!("rewriting {kernel_name}"))?;

        // The staging copy took objcopy's default mode; restore the input's.
        let permissions = fs::metadata(artifact.absolute())
            .with_context(|| format!("reading permissions of {kernel_name}"))?
            .permissions();
        fs::set_permissions(&dest, permissions)
            .with_context(|| format!("restoring permissions of {}", dest.display()))?;
        Ok(())
    }

    fn visit_kernel_database(
        &self,
        artifact: &ArtifactPath,
        database: KernelDatabase,
    ) -> Result<()> {
        self.visited
            .lock()
            .expect("statistics lock poisoned")
            .kernel_databases
            .push(artifact.relative.clone());
        info!(
            "copying {} database {} ({} architectures)",
            database.kind,
            artifact.relative.display(),
            database.architectures().len()
        );

        // Databases are carried verbatim in the map phase; the per-arch
        // split happens when artifacts are recombined downstream.
        let source = artifact.absolute();
        for entry in WalkDir::new(&source)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry.with_context(|| format!("walking {}", source.display()))?;
            let relative = entry
                .path()
                .strip_prefix(&source)
                .expect("walkdir yields descendants of the root");
            let dest = self.output_root.join(&artifact.relative).join(relative);
            if entry.file_type().is_dir() {
                fs::create_dir_all(&dest)
                    .with_context(|| format!("creating directory {}", dest.display()))?;
            } else {
                copy_preserving(entry.path(), &dest)?;
            }
        }
        Ok(())
    }
}
