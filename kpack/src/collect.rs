//! Discovery of sharded map-phase outputs.
//!
//! Each build shard is a directory of artifact directories named
//! `<component>_generic` or `<component>_<gfxN>`. Generic artifacts are
//! taken only from the designated primary shard; architecture-specific
//! artifacts come from whichever shard supplies them first (shards are
//! visited in lexicographic order, so the winner is deterministic).

use crate::artifact::{read_artifact_manifest, ARTIFACT_MANIFEST};
use anyhow::{bail, ensure, Context, Result};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub(crate) struct CollectedArtifact {
    pub(crate) path: PathBuf,
    pub(crate) shard_name: String,
    pub(crate) component_name: String,
    /// `None` for generic artifacts.
    pub(crate) architecture: Option<String>,
    pub(crate) prefixes: Vec<String>,
}

impl CollectedArtifact {
    pub(crate) fn is_generic(&self) -> bool {
        self.architecture.is_none()
    }
}

/// Which of the requested architectures a component can actually supply.
#[derive(Debug)]
pub(crate) struct Availability {
    pub(crate) available: Vec<String>,
    pub(crate) missing: Vec<String>,
}

pub(crate) struct ArtifactCollector {
    shards_dir: PathBuf,
    primary_shard: String,
    /// component → architecture → artifact, across all shards.
    arch_artifacts: BTreeMap<String, BTreeMap<String, CollectedArtifact>>,
    /// component → generic artifact, from the primary shard only.
    generic_artifacts: BTreeMap<String, CollectedArtifact>,
}

impl ArtifactCollector {
    pub(crate) fn new(shards_dir: &Path, primary_shard: &str) -> Self {
        Self {
            shards_dir: shards_dir.to_path_buf(),
            primary_shard: primary_shard.to_string(),
            arch_artifacts: BTreeMap::new(),
            generic_artifacts: BTreeMap::new(),
        }
    }

    pub(crate) fn collect(&mut self) -> Result<()> {
        ensure!(
            self.shards_dir.is_dir(),
            "shards directory does not exist: {}",
            self.shards_dir.display()
        );
        ensure!(
            self.shards_dir.join(&self.primary_shard).is_dir(),
            "primary shard '{}' not found in {}",
            self.primary_shard,
            self.shards_dir.display()
        );

        let mut shard_dirs: Vec<PathBuf> = std::fs::read_dir(&self.shards_dir)
            .with_context(|| format!("reading {}", self.shards_dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_dir())
            .collect();
        ensure!(
            !shard_dirs.is_empty(),
            "no shard directories found in {}",
            self.shards_dir.display()
        );
        shard_dirs.sort();

        for shard_dir in &shard_dirs {
            self.scan_shard(shard_dir)?;
        }

        ensure!(
            !self.generic_artifacts.is_empty(),
            "no generic artifacts found in primary shard '{}'",
            self.primary_shard
        );
        info!(
            "collected {} generic and {} architecture-specific artifacts from {} shard(s)",
            self.generic_artifacts.len(),
            self.arch_artifacts.values().map(BTreeMap::len).sum::<usize>(),
            shard_dirs.len()
        );
        Ok(())
    }

    fn scan_shard(&mut self, shard_dir: &Path) -> Result<()> {
        let shard_name = shard_dir
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("shard directory has no UTF-8 name: {}", shard_dir.display()))?
            .to_string();
        debug!("scanning shard {shard_name}");

        let mut artifact_dirs: Vec<PathBuf> = std::fs::read_dir(shard_dir)
            .with_context(|| format!("reading {}", shard_dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_dir())
            .collect();
        artifact_dirs.sort();

        for artifact_dir in artifact_dirs {
            if !artifact_dir.join(ARTIFACT_MANIFEST).is_file() {
                debug!(
                    "skipping {}: no {ARTIFACT_MANIFEST}",
                    artifact_dir.display()
                );
                continue;
            }
            let dir_name = artifact_dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            let Some((component_name, architecture)) = parse_artifact_name(dir_name) else {
                debug!("skipping {}: unrecognized artifact name", artifact_dir.display());
                continue;
            };

            let prefixes = read_artifact_manifest(&artifact_dir)?;
            let artifact = CollectedArtifact {
                path: artifact_dir.clone(),
                shard_name: shard_name.clone(),
                component_name: component_name.clone(),
                architecture: architecture.clone(),
                prefixes,
            };

            match architecture {
                None => {
                    if shard_name != self.primary_shard {
                        info!(
                            "ignoring generic artifact {component_name} from non-primary shard {shard_name}"
                        );
                        continue;
                    }
                    if self.generic_artifacts.contains_key(&component_name) {
                        bail!(
                            "duplicate generic artifact for component '{component_name}' \
                             in primary shard '{}'",
                            self.primary_shard
                        );
                    }
                    self.generic_artifacts.insert(component_name, artifact);
                }
                Some(arch) => {
                    let entry = self.arch_artifacts.entry(component_name.clone()).or_default();
                    if let Some(existing) = entry.get(&arch) {
                        warn!(
                            "duplicate {arch} artifact for '{component_name}': \
                             using {}, ignoring {shard_name}",
                            existing.shard_name
                        );
                        continue;
                    }
                    entry.insert(arch, artifact);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn generic_artifact(&self, component_name: &str) -> Option<&CollectedArtifact> {
        self.generic_artifacts.get(component_name)
    }

    pub(crate) fn arch_artifact(
        &self,
        component_name: &str,
        architecture: &str,
    ) -> Option<&CollectedArtifact> {
        self.arch_artifacts.get(component_name)?.get(architecture)
    }

    pub(crate) fn available_architectures(&self, component_name: &str) -> Vec<String> {
        self.arch_artifacts
            .get(component_name)
            .map(|arches| arches.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn component_names(&self) -> BTreeSet<String> {
        self.generic_artifacts
            .keys()
            .chain(self.arch_artifacts.keys())
            .cloned()
            .collect()
    }

    /// Split the requested architectures into available and missing,
    /// requiring the component's generic artifact to exist.
    pub(crate) fn validate_availability(
        &self,
        component_name: &str,
        required: &[String],
    ) -> Result<Availability> {
        ensure!(
            self.generic_artifacts.contains_key(component_name),
            "generic artifact not found for component '{component_name}' \
             in primary shard '{}'",
            self.primary_shard
        );
        let present = self.available_architectures(component_name);
        let (available, missing) = required
            .iter()
            .cloned()
            .partition(|arch| present.contains(arch));
        Ok(Availability { available, missing })
    }
}

/// Parse `<component>_generic` or `<component>_<gfxN>`; anything else is not
/// an artifact directory this phase understands.
fn parse_artifact_name(name: &str) -> Option<(String, Option<String>)> {
    if let Some(component) = name.strip_suffix("_generic") {
        return Some((component.to_string(), None));
    }
    let (component, suffix) = name.rsplit_once('_')?;
    suffix
        .starts_with("gfx")
        .then(|| (component.to_string(), Some(suffix.to_string())))
}
