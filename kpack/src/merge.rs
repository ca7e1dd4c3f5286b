//! Merging of `.kpm` component manifests from shard artifacts.
//!
//! Merging is a union of the per-architecture entries. Two manifests may
//! mention the same architecture only when they agree on the file, its size
//! and its kernel count; any disagreement means the shards built different
//! device code for the same architecture, which is fatal. Merging agreeing
//! manifests is commutative and idempotent.

use anyhow::{bail, ensure, Context, Result};
use kpack_archive::kpm::{KpackFileEntry, PackManifest};
use log::debug;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub(crate) fn merge_manifests(
    manifests: &[PackManifest],
    component_name: &str,
    prefix: &str,
) -> Result<PackManifest> {
    ensure!(!manifests.is_empty(), "cannot merge an empty list of manifests");

    let mut merged: BTreeMap<String, KpackFileEntry> = BTreeMap::new();
    for manifest in manifests {
        ensure!(
            manifest.component_name == component_name,
            "component name mismatch: expected '{component_name}', got '{}'",
            manifest.component_name
        );
        for (arch, entry) in &manifest.kpack_files {
            if let Some(existing) = merged.get(arch) {
                if existing != entry {
                    bail!(
                        "conflicting kpack entries for architecture '{arch}': \
                         {}/{}/{} vs {}/{}/{}",
                        existing.file,
                        existing.size,
                        existing.kernel_count,
                        entry.file,
                        entry.size,
                        entry.kernel_count,
                    );
                }
                continue;
            }
            merged.insert(arch.clone(), entry.clone());
        }
    }

    let mut result = PackManifest::new(component_name, prefix);
    result.kpack_files = merged;
    Ok(result)
}

/// All `.kpm` manifests under `<artifact>/<prefix>/.kpack/`, sorted by file
/// name. A corrupt manifest is fatal: it means the map phase emitted an
/// incomplete artifact.
pub(crate) fn find_manifests_in_artifact(
    artifact_dir: &Path,
    prefix: &str,
) -> Result<Vec<(PathBuf, PackManifest)>> {
    let kpack_dir = artifact_dir.join(prefix).join(".kpack");
    if !kpack_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut paths: Vec<PathBuf> = std::fs::read_dir(&kpack_dir)
        .with_context(|| format!("reading {}", kpack_dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "kpm"))
        .collect();
    paths.sort();

    let mut results = Vec::with_capacity(paths.len());
    for path in paths {
        let manifest = PackManifest::from_file(&path)
            .with_context(|| format!("manifest {} from the map phase is corrupt", path.display()))?;
        debug!("found manifest {}", path.display());
        results.push((path, manifest));
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(arch: &str, file: &str, size: u64, kernel_count: u64) -> PackManifest {
        let mut m = PackManifest::new("blas_lib", "stage");
        m.kpack_files.insert(
            arch.to_string(),
            KpackFileEntry {
                file: file.to_string(),
                size,
                kernel_count,
            },
        );
        m
    }

    #[test]
    fn merging_disjoint_architectures_unions() {
        let a = manifest("gfx1100", "a.kpack", 100, 5);
        let b = manifest("gfx1101", "b.kpack", 200, 7);
        let merged = merge_manifests(&[a, b], "blas_lib", "stage").unwrap();
        assert_eq!(merged.kpack_files.len(), 2);
        assert_eq!(merged.prefix, "stage");
    }

    #[test]
    fn merging_is_commutative_and_idempotent_when_agreeing() {
        let a = manifest("gfx1100", "a.kpack", 100, 5);
        let b = manifest("gfx1101", "b.kpack", 200, 7);

        let ab = merge_manifests(&[a.clone(), b.clone()], "blas_lib", "stage").unwrap();
        let ba = merge_manifests(&[b.clone(), a.clone()], "blas_lib", "stage").unwrap();
        assert_eq!(ab, ba);

        let aa = merge_manifests(&[a.clone(), a.clone()], "blas_lib", "stage").unwrap();
        assert_eq!(aa.kpack_files, a.kpack_files);
    }

    #[test]
    fn disagreeing_manifests_conflict() {
        let a = manifest("gfx1100", "a.kpack", 100, 5);
        let b = manifest("gfx1100", "a.kpack", 101, 5);
        let err = merge_manifests(&[a, b], "blas_lib", "stage").unwrap_err();
        assert!(format!("{err:#}").contains("gfx1100"));
    }

    #[test]
    fn component_mismatch_is_rejected() {
        let a = manifest("gfx1100", "a.kpack", 100, 5);
        assert!(merge_manifests(&[a], "other_lib", "stage").is_err());
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(merge_manifests(&[], "blas_lib", "stage").is_err());
    }
}
