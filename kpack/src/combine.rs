//! Assembly of architecture-group packages from collected shard artifacts.
//!
//! Every component yields one `<component>_generic` artifact (host files
//! only, `.kpack` trees stripped) and, for each group with at least one
//! available architecture, one `<component>_<group>` artifact carrying the
//! kpack archives, architecture-tagged database files, and a freshly merged
//! `.kpm` manifest restricted to the architectures actually included.

use crate::artifact::{copy_tree_excluding_kpack, write_artifact_manifest};
use crate::collect::{ArtifactCollector, CollectedArtifact};
use crate::config::ArchitectureGroup;
use crate::merge::{find_manifests_in_artifact, merge_manifests};
use anyhow::{bail, Context, Result};
use kpack_archive::kpm::{KpackFileEntry, PackManifest};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

pub(crate) struct ArtifactCombiner<'a> {
    collector: &'a ArtifactCollector,
    created_generics: BTreeSet<String>,
}

impl<'a> ArtifactCombiner<'a> {
    pub(crate) fn new(collector: &'a ArtifactCollector) -> Self {
        Self {
            collector,
            created_generics: BTreeSet::new(),
        }
    }

    pub(crate) fn combine_component(
        &mut self,
        component_name: &str,
        group_name: &str,
        group: &ArchitectureGroup,
        output_dir: &Path,
    ) -> Result<()> {
        info!("combining component '{component_name}' for group '{group_name}'");

        let generic = self
            .collector
            .generic_artifact(component_name)
            .with_context(|| {
                format!("generic artifact not found for component '{component_name}'")
            })?;
        let availability = self
            .collector
            .validate_availability(component_name, &group.architectures)?;
        if !availability.missing.is_empty() {
            debug!(
                "{component_name}/{group_name}: missing architectures {:?}",
                availability.missing
            );
        }

        // The generic artifact is produced once per component, not per group.
        if self.created_generics.insert(component_name.to_string()) {
            self.create_generic_artifact(
                generic,
                &output_dir.join(format!("{component_name}_generic")),
            )?;
        }

        // Components with no device code yield only the generic artifact.
        if availability.available.is_empty() {
            debug!("{component_name}: no device code for group '{group_name}'");
            return Ok(());
        }

        let group_dir = output_dir.join(format!("{component_name}_{group_name}"));
        fs::create_dir_all(&group_dir)
            .with_context(|| format!("creating {}", group_dir.display()))?;

        let mut group_prefixes: BTreeSet<String> = BTreeSet::new();
        for arch in &availability.available {
            let artifact = self
                .collector
                .arch_artifact(component_name, arch)
                .with_context(|| format!("architecture artifact {arch} unexpectedly missing"))?;
            group_prefixes.extend(artifact.prefixes.iter().cloned());
            self.copy_arch_content(artifact, &group_dir)?;
        }

        let prefixes: Vec<String> = group_prefixes.into_iter().collect();
        for prefix in &prefixes {
            self.write_group_manifest(
                component_name,
                prefix,
                &availability.available,
                &group_dir,
            )?;
        }
        write_artifact_manifest(&group_dir, &prefixes)?;
        Ok(())
    }

    fn create_generic_artifact(
        &self,
        generic: &CollectedArtifact,
        output_dir: &Path,
    ) -> Result<()> {
        info!("creating generic artifact {}", output_dir.display());
        fs::create_dir_all(output_dir)
            .with_context(|| format!("creating {}", output_dir.display()))?;
        for prefix in &generic.prefixes {
            let source = generic.path.join(prefix);
            if !source.exists() {
                debug!("skipping missing prefix {prefix}");
                continue;
            }
            copy_tree_excluding_kpack(&source, &output_dir.join(prefix))?;
        }
        write_artifact_manifest(output_dir, &generic.prefixes)
    }

    /// Copy only the architecture-specific content of an artifact: the
    /// `.kpack` archives (including the `kpack/stage/.kpack` layout) and any
    /// file carrying the architecture tag in its name. Host code stays in
    /// the generic artifact.
    fn copy_arch_content(&self, artifact: &CollectedArtifact, output_dir: &Path) -> Result<()> {
        let arch = artifact
            .architecture
            .as_deref()
            .context("architecture artifact has no architecture set")?;
        debug!("copying {arch} content from {}", artifact.path.display());

        for prefix in &artifact.prefixes {
            let source_prefix = artifact.path.join(prefix);
            if !source_prefix.exists() {
                continue;
            }
            let dest_prefix = output_dir.join(prefix);

            for kpack_dir in [".kpack", "kpack/stage/.kpack"] {
                let source_kpack = source_prefix.join(kpack_dir);
                if !source_kpack.is_dir() {
                    continue;
                }
                let dest_kpack = dest_prefix.join(kpack_dir);
                fs::create_dir_all(&dest_kpack)
                    .with_context(|| format!("creating {}", dest_kpack.display()))?;
                let mut entries: Vec<_> = fs::read_dir(&source_kpack)
                    .with_context(|| format!("reading {}", source_kpack.display()))?
                    .filter_map(|entry| entry.ok().map(|e| e.path()))
                    .filter(|path| path.extension().is_some_and(|ext| ext == "kpack"))
                    .collect();
                entries.sort();
                for source_file in entries {
                    let file_name = source_file.file_name().expect("read_dir yields names");
                    copy_checked(&source_file, &dest_kpack.join(file_name))?;
                }
            }

            self.copy_arch_tagged_files(&source_prefix, &dest_prefix, arch)?;
        }
        Ok(())
    }

    /// Database files are matched by the architecture substring in their
    /// file name (e.g. `TensileLibrary_gfx1100.dat`).
    fn copy_arch_tagged_files(&self, source: &Path, dest: &Path, arch: &str) -> Result<()> {
        for entry in WalkDir::new(source)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry.with_context(|| format!("walking {}", source.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(source)
                .expect("walkdir yields descendants of the root");
            // Archives are handled separately, both layouts.
            if relative.components().any(|c| c.as_os_str() == ".kpack")
                || relative.starts_with("kpack/stage")
            {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if !name.contains(arch) {
                continue;
            }
            copy_checked(entry.path(), &dest.join(relative))?;
        }
        Ok(())
    }

    /// Merge the source artifacts' manifests for this prefix, restricted to
    /// the included architectures; when the map phase wrote no manifests,
    /// synthesize entries from the copied kpack file names.
    fn write_group_manifest(
        &self,
        component_name: &str,
        prefix: &str,
        architectures: &[String],
        group_dir: &Path,
    ) -> Result<()> {
        let dest_kpack = group_dir.join(prefix).join(".kpack");
        if !dest_kpack.is_dir() {
            debug!("no .kpack directory in prefix {prefix}, skipping manifest");
            return Ok(());
        }

        let mut source_manifests = Vec::new();
        for arch in architectures {
            let Some(artifact) = self.collector.arch_artifact(component_name, arch) else {
                continue;
            };
            for (_, manifest) in find_manifests_in_artifact(&artifact.path, prefix)? {
                if manifest.component_name != component_name {
                    debug!(
                        "ignoring manifest for foreign component '{}' in {}",
                        manifest.component_name,
                        artifact.path.display()
                    );
                    continue;
                }
                source_manifests.push(manifest);
            }
        }

        let mut entries: BTreeMap<String, KpackFileEntry> = if source_manifests.is_empty() {
            self.synthesize_entries(&dest_kpack, architectures)?
        } else {
            merge_manifests(&source_manifests, component_name, prefix)
                .with_context(|| format!("merging manifests for prefix '{prefix}'"))?
                .kpack_files
        };
        entries.retain(|arch, _| architectures.contains(arch));

        if entries.is_empty() {
            debug!("no kpack entries for prefix {prefix}, skipping manifest");
            return Ok(());
        }
        let mut manifest = PackManifest::new(component_name, prefix);
        manifest.kpack_files = entries;
        manifest
            .to_file(&dest_kpack.join(format!("{component_name}.kpm")))
            .with_context(|| format!("writing manifest for prefix '{prefix}'"))
    }

    /// Manifest entries recovered from `*_<arch>.kpack` file names. The
    /// kernel count is not recoverable without decoding each archive and the
    /// runtime does not consume it, so it is recorded as zero.
    fn synthesize_entries(
        &self,
        kpack_dir: &Path,
        architectures: &[String],
    ) -> Result<BTreeMap<String, KpackFileEntry>> {
        let mut entries = BTreeMap::new();
        let mut files: Vec<_> = fs::read_dir(kpack_dir)
            .with_context(|| format!("reading {}", kpack_dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "kpack"))
            .collect();
        files.sort();

        for file in files {
            let Some(stem) = file.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some((_, arch)) = stem.rsplit_once('_') else {
                warn!("skipping kpack file with unexpected name: {}", file.display());
                continue;
            };
            if !architectures.iter().any(|a| a == arch) {
                continue;
            }
            let size = fs::metadata(&file)
                .with_context(|| format!("reading size of {}", file.display()))?
                .len();
            entries.insert(
                arch.to_string(),
                KpackFileEntry {
                    file: file
                        .file_name()
                        .expect("read_dir yields names")
                        .to_string_lossy()
                        .into_owned(),
                    size,
                    kernel_count: 0,
                },
            );
        }
        Ok(entries)
    }
}

fn copy_checked(source: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    fs::copy(source, dest)
        .with_context(|| format!("copying {} to {}", source.display(), dest.display()))?;
    let source_len = fs::metadata(source)?.len();
    let dest_len = fs::metadata(dest)?.len();
    if source_len != dest_len {
        bail!(
            "size mismatch after copying {}: {source_len} -> {dest_len}",
            dest.display()
        );
    }
    Ok(())
}
