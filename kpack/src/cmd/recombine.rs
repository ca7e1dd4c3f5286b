use crate::collect::ArtifactCollector;
use crate::combine::ArtifactCombiner;
use crate::config::PackagingConfig;
use anyhow::{ensure, Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;

/// Combine sharded map-phase outputs into one generic artifact per component
/// plus one artifact per architecture group.
#[derive(Debug, Parser)]
pub(crate) struct Recombine {
    /// Directory containing shard subdirectories from the map phase.
    #[arg(long = "input-shards-dir")]
    input_shards_dir: PathBuf,

    /// JSON configuration file defining the package groups.
    #[arg(long)]
    config: PathBuf,

    /// Output directory for the combined artifacts.
    #[arg(long = "output-dir")]
    output_dir: PathBuf,

    /// Only process this component.
    #[arg(long)]
    component: Option<String>,
}

impl Recombine {
    pub(crate) fn run(&self) -> Result<()> {
        let config = PackagingConfig::load(&self.config)?;

        let mut collector = ArtifactCollector::new(&self.input_shards_dir, &config.primary_shard);
        collector.collect()?;

        let components = collector.component_names();
        let selected: Vec<String> = match &self.component {
            Some(component) => {
                ensure!(
                    components.contains(component),
                    "component '{component}' not found in any shard"
                );
                vec![component.clone()]
            }
            None => components.into_iter().collect(),
        };

        std::fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("creating output directory {}", self.output_dir.display()))?;

        let mut combiner = ArtifactCombiner::new(&collector);
        for component in &selected {
            for (group_name, group) in &config.architecture_groups {
                combiner
                    .combine_component(component, group_name, group, &self.output_dir)
                    .with_context(|| {
                        format!("combining component '{component}' for group '{group_name}'")
                    })?;
            }
        }

        info!(
            "recombined {} component(s) across {} group(s) into {}",
            selected.len(),
            config.architecture_groups.len(),
            self.output_dir.display()
        );
        Ok(())
    }
}
