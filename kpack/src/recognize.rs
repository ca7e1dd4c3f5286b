//! Kernel-database recognizers.
//!
//! Some libraries ship their device code as on-disk kernel databases rather
//! than embedded bundles. A recognizer pairs a cheap path heuristic with a
//! more expensive parse; the registry tries recognizers in insertion order
//! and the first one to produce a database claims the whole subtree.

use crate::scan::ArtifactPath;
use anyhow::{Context, Result};
use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const CODE_OBJECT_EXTENSIONS: [&str; 3] = ["co", "hsaco", "dat"];

/// One file inside a kernel database. Files without an architecture tag are
/// generic metadata shared by every architecture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct KernelArtifact {
    /// Path relative to the database root.
    pub(crate) relative_path: PathBuf,
    pub(crate) gfx_target: Option<String>,
    pub(crate) artifact_type: &'static str,
}

/// A recognized kernel database rooted at a directory of the install tree.
#[derive(Debug)]
pub(crate) struct KernelDatabase {
    pub(crate) artifact_path: ArtifactPath,
    pub(crate) kind: &'static str,
    artifacts: Vec<KernelArtifact>,
}

impl KernelDatabase {
    /// Sorted, de-duplicated gfx targets present in the database.
    pub(crate) fn architectures(&self) -> Vec<String> {
        self.artifacts
            .iter()
            .filter_map(|a| a.gfx_target.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub(crate) fn kernel_artifacts(&self) -> impl Iterator<Item = &KernelArtifact> {
        self.artifacts.iter()
    }
}

pub(crate) trait DatabaseRecognizer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fast heuristic; must not touch file contents.
    fn can_recognize(&self, artifact: &ArtifactPath) -> bool;

    /// Expensive validation and parsing; `None` when the path turns out not
    /// to be a database of this type after all.
    fn recognize(&self, artifact: &ArtifactPath) -> Result<Option<KernelDatabase>>;
}

pub(crate) struct RecognizerRegistry {
    recognizers: Vec<Box<dyn DatabaseRecognizer>>,
}

impl RecognizerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            recognizers: Vec::new(),
        }
    }

    /// The registry with the stock recognizers, in their canonical order.
    pub(crate) fn with_default_recognizers() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(TensileStyleRecognizer::rocblas()));
        registry.register(Box::new(TensileStyleRecognizer::hipblaslt()));
        registry.register(Box::new(AotritonRecognizer::new()));
        registry
    }

    pub(crate) fn register(&mut self, recognizer: Box<dyn DatabaseRecognizer>) {
        self.recognizers.push(recognizer);
    }

    pub(crate) fn try_recognize(&self, artifact: &ArtifactPath) -> Result<Option<KernelDatabase>> {
        for recognizer in &self.recognizers {
            if recognizer.can_recognize(artifact) {
                if let Some(database) = recognizer.recognize(artifact)? {
                    return Ok(Some(database));
                }
            }
        }
        Ok(None)
    }
}

fn ends_with_components(path: &Path, suffix: &[&str]) -> bool {
    let components: Vec<_> = path
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .collect();
    components.ends_with(suffix)
}

/// rocBLAS and hipBLASLt both lay their Tensile kernels out as
/// `<lib>/library/*_gfx*.{co,hsaco,dat}`; only the library directory name
/// differs.
struct TensileStyleRecognizer {
    kind: &'static str,
    library_parent: &'static str,
    arch_pattern: Regex,
}

impl TensileStyleRecognizer {
    fn new(kind: &'static str, library_parent: &'static str) -> Self {
        Self {
            kind,
            library_parent,
            arch_pattern: Regex::new(r"gfx(\d+[a-z]*)").expect("static pattern"),
        }
    }

    fn rocblas() -> Self {
        Self::new("rocblas", "rocblas")
    }

    fn hipblaslt() -> Self {
        Self::new("hipblaslt", "hipblaslt")
    }
}

impl DatabaseRecognizer for TensileStyleRecognizer {
    fn name(&self) -> &'static str {
        self.kind
    }

    fn can_recognize(&self, artifact: &ArtifactPath) -> bool {
        ends_with_components(&artifact.relative, &[self.library_parent, "library"])
    }

    fn recognize(&self, artifact: &ArtifactPath) -> Result<Option<KernelDatabase>> {
        let root = artifact.absolute();
        let mut artifacts = Vec::new();
        let mut tagged = 0usize;

        for entry in WalkDir::new(&root).min_depth(1).sort_by_file_name() {
            let entry = entry.with_context(|| format!("walking {}", root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let extension = entry.path().extension().and_then(|e| e.to_str());
            if !extension.is_some_and(|e| CODE_OBJECT_EXTENSIONS.contains(&e)) {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy();
            let gfx_target = self
                .arch_pattern
                .captures(&file_name)
                .map(|c| format!("gfx{}", &c[1]));
            let artifact_type = if gfx_target.is_some() {
                tagged += 1;
                "code_object"
            } else {
                // Generic data files shared by all architectures.
                "metadata"
            };
            artifacts.push(KernelArtifact {
                relative_path: entry
                    .path()
                    .strip_prefix(&root)
                    .expect("walkdir yields descendants of the root")
                    .to_path_buf(),
                gfx_target,
                artifact_type,
            });
        }

        if tagged == 0 {
            return Ok(None);
        }
        Ok(Some(KernelDatabase {
            artifact_path: artifact.clone(),
            kind: self.kind,
            artifacts,
        }))
    }
}

/// AOTriton organizes kernels as `aotriton/kernels/<gfx-arch>/…`.
struct AotritonRecognizer;

impl AotritonRecognizer {
    fn new() -> Self {
        Self
    }
}

impl DatabaseRecognizer for AotritonRecognizer {
    fn name(&self) -> &'static str {
        "aotriton"
    }

    fn can_recognize(&self, artifact: &ArtifactPath) -> bool {
        ends_with_components(&artifact.relative, &["aotriton", "kernels"])
    }

    fn recognize(&self, artifact: &ArtifactPath) -> Result<Option<KernelDatabase>> {
        let root = artifact.absolute();
        let mut artifacts = Vec::new();
        let mut arch_dirs = 0usize;

        let mut entries: Vec<_> = std::fs::read_dir(&root)
            .with_context(|| format!("reading {}", root.display()))?
            .collect::<std::io::Result<_>>()
            .with_context(|| format!("reading {}", root.display()))?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let name = entry.file_name();
            let Some(arch) = name.to_str().filter(|n| n.starts_with("gfx")) else {
                continue;
            };
            if !entry
                .file_type()
                .with_context(|| format!("stat {}", entry.path().display()))?
                .is_dir()
            {
                continue;
            }
            arch_dirs += 1;
            for file in WalkDir::new(entry.path()).min_depth(1).sort_by_file_name() {
                let file = file.with_context(|| format!("walking {}", root.display()))?;
                if !file.file_type().is_file() {
                    continue;
                }
                artifacts.push(KernelArtifact {
                    relative_path: file
                        .path()
                        .strip_prefix(&root)
                        .expect("walkdir yields descendants of the root")
                        .to_path_buf(),
                    gfx_target: Some(arch.to_string()),
                    artifact_type: "code_object",
                });
            }
        }

        if arch_dirs == 0 {
            return Ok(None);
        }
        Ok(Some(KernelDatabase {
            artifact_path: artifact.clone(),
            kind: "aotriton",
            artifacts,
        }))
    }
}
