//! Install-tree scanner.
//!
//! Walks every path under a root in sorted order and dispatches each one to
//! a visitor as exactly one of: a kernel database (a directory claimed by a
//! recognizer), a bundled binary, or an opaque file. Subtrees claimed by a
//! database are never re-entered, so no path is classified twice.

use crate::recognize::{KernelDatabase, RecognizerRegistry};
use anyhow::{anyhow, Result};
use log::{debug, error};
use offload_bundle::binary::{is_bundled_binary, BundledBinary};
use offload_bundle::Toolchain;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use walkdir::WalkDir;

/// A path relative to a scan root. The dual representation lets consumers
/// materialize altered copies from the relative path while still reading the
/// original file through the absolute one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ArtifactPath {
    pub(crate) root: PathBuf,
    pub(crate) relative: PathBuf,
}

impl ArtifactPath {
    pub(crate) fn new(root: impl Into<PathBuf>, relative: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            relative: relative.into(),
        }
    }

    pub(crate) fn absolute(&self) -> PathBuf {
        self.root.join(&self.relative)
    }
}

/// Capability set the scanner dispatches to. Visitors must tolerate
/// concurrent calls when the scanner runs with a worker pool.
pub(crate) trait ArtifactVisitor: Sync {
    fn visit_opaque_file(&self, _artifact: &ArtifactPath) -> Result<()> {
        Ok(())
    }

    fn visit_bundled_binary(&self, _artifact: &ArtifactPath, _binary: BundledBinary) -> Result<()> {
        Ok(())
    }

    fn visit_kernel_database(
        &self,
        _artifact: &ArtifactPath,
        _database: KernelDatabase,
    ) -> Result<()> {
        Ok(())
    }
}

pub(crate) struct ArtifactScanner<'a> {
    registry: &'a RecognizerRegistry,
    toolchain: Option<Toolchain>,
    pool: Option<&'a rayon::ThreadPool>,
}

impl<'a> ArtifactScanner<'a> {
    pub(crate) fn new(registry: &'a RecognizerRegistry) -> Self {
        Self {
            registry,
            toolchain: None,
            pool: None,
        }
    }

    /// Enable bundled-binary detection; without a toolchain every file is
    /// either a database member or opaque.
    pub(crate) fn with_toolchain(mut self, toolchain: Toolchain) -> Self {
        self.toolchain = Some(toolchain);
        self
    }

    /// Process paths on a worker pool instead of the walking thread.
    pub(crate) fn with_pool(mut self, pool: &'a rayon::ThreadPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub(crate) fn scan_tree(&self, root: &Path, visitor: &dyn ArtifactVisitor) -> Result<()> {
        let errors: Mutex<Vec<anyhow::Error>> = Mutex::new(Vec::new());

        match self.pool {
            Some(pool) => pool.scope(|scope| {
                self.walk(root, visitor, &errors, |job| {
                    scope.spawn(move |_| job());
                });
            }),
            None => self.walk(root, visitor, &errors, |job| job()),
        }

        let mut collected = errors.into_inner().expect("error list lock poisoned");
        if collected.is_empty() {
            return Ok(());
        }
        for other in collected.iter().skip(1) {
            error!("additionally failed: {other:#}");
        }
        let count = collected.len();
        Err(collected.remove(0).context(format!("scan failed with {count} error(s)")))
    }

    /// Walk the tree, recognizing databases on the walking thread (so the
    /// claimed-subtree bookkeeping needs no locking) and handing everything
    /// else to `dispatch`. Submission stops at the first recorded error;
    /// already-dispatched work is awaited, never interrupted.
    fn walk<'s>(
        &'s self,
        root: &Path,
        visitor: &'s dyn ArtifactVisitor,
        errors: &'s Mutex<Vec<anyhow::Error>>,
        mut dispatch: impl FnMut(Box<dyn FnOnce() + Send + 's>),
    ) {
        let mut claimed: Vec<PathBuf> = Vec::new();
        let mut iterator = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();

        while let Some(entry) = iterator.next() {
            if !errors.lock().expect("error list lock poisoned").is_empty() {
                return;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    record(errors, anyhow!(e).context("walking input tree"));
                    return;
                }
            };
            let relative = entry
                .path()
                .strip_prefix(root)
                .expect("walkdir yields descendants of the root")
                .to_path_buf();

            if claimed.iter().any(|db| relative.starts_with(db)) {
                continue;
            }

            let artifact = ArtifactPath::new(root, relative);
            if entry.file_type().is_dir() {
                match self.registry.try_recognize(&artifact) {
                    Ok(Some(database)) => {
                        debug!(
                            "{} claimed as {} kernel database",
                            artifact.relative.display(),
                            database.kind
                        );
                        claimed.push(artifact.relative.clone());
                        iterator.skip_current_dir();
                        dispatch(Box::new(move || {
                            let context =
                                format!("kernel database {}", artifact.relative.display());
                            if let Err(e) = visitor.visit_kernel_database(&artifact, database) {
                                record(errors, e.context(context));
                            }
                        }));
                    }
                    Ok(None) => {}
                    Err(e) => record(errors, e),
                }
                continue;
            }

            let is_symlink = entry.file_type().is_symlink();
            let toolchain = self.toolchain.clone();
            dispatch(Box::new(move || {
                if let Err(e) = process_file(&artifact, is_symlink, toolchain, visitor) {
                    record(errors, e.context(format!("processing {}", artifact.relative.display())));
                }
            }));
        }
    }
}

fn record(errors: &Mutex<Vec<anyhow::Error>>, error: anyhow::Error) {
    errors.lock().expect("error list lock poisoned").push(error);
}

fn process_file(
    artifact: &ArtifactPath,
    is_symlink: bool,
    toolchain: Option<Toolchain>,
    visitor: &dyn ArtifactVisitor,
) -> Result<()> {
    // Symlinks point at binaries that are classified on their own; the link
    // itself is always opaque.
    if !is_symlink && is_binary_candidate(&artifact.relative) {
        if let Some(toolchain) = toolchain {
            let absolute = artifact.absolute();
            if is_bundled_binary(&absolute)? {
                let binary = BundledBinary::open(toolchain, &absolute)?;
                return visitor.visit_bundled_binary(artifact, binary);
            }
        }
    }
    visitor.visit_opaque_file(artifact)
}

/// Fast filter for files worth the ELF section probe: shared libraries
/// (including versioned `.so.N` names), extensionless executables, and the
/// handful of suffixes device code ships under.
fn is_binary_candidate(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let name = name.to_lowercase();
    if name.contains(".so") {
        return true;
    }
    match name.rsplit_once('.').map(|(_, ext)| ext) {
        Some("exe" | "dll" | "hip") => true,
        Some(_) => false,
        None => true,
    }
}
