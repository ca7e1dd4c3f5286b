//! Recombination configuration: which shard supplies generic artifacts and
//! how architectures group into packages.

use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PackagingConfig {
    pub(crate) primary_shard: String,
    pub(crate) architecture_groups: BTreeMap<String, ArchitectureGroup>,
    #[serde(default)]
    pub(crate) validation: ValidationRules,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ArchitectureGroup {
    #[serde(default)]
    pub(crate) display_name: Option<String>,
    pub(crate) architectures: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ValidationRules {
    #[serde(default = "default_true")]
    pub(crate) error_on_duplicate_device_code: bool,
    #[serde(default)]
    pub(crate) verify_generic_artifacts_match: bool,
    #[serde(default)]
    pub(crate) error_on_missing_architecture: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            error_on_duplicate_device_code: true,
            verify_generic_artifacts_match: false,
            error_on_missing_architecture: false,
        }
    }
}

impl PackagingConfig {
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("parsing configuration {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        ensure!(!self.primary_shard.is_empty(), "primary_shard must be specified");
        ensure!(
            !self.architecture_groups.is_empty(),
            "at least one architecture group must be defined"
        );
        for (name, group) in &self.architecture_groups {
            ensure!(
                !group.architectures.is_empty(),
                "architecture group '{name}' must have at least one architecture"
            );
            for arch in &group.architectures {
                if !arch.starts_with("gfx") {
                    bail!("invalid architecture '{arch}' in group '{name}': must start with 'gfx'");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), content).unwrap();
        file
    }

    #[test]
    fn parses_full_configuration() {
        let file = write_config(
            r#"{
                "primary_shard": "gfx110X_build",
                "architecture_groups": {
                    "gfx110X": {
                        "display_name": "Navi 3x",
                        "architectures": ["gfx1100", "gfx1101"]
                    },
                    "gfx120X": { "architectures": ["gfx1200"] }
                },
                "validation": { "error_on_missing_architecture": true }
            }"#,
        );
        let config = PackagingConfig::load(file.path()).unwrap();
        assert_eq!(config.primary_shard, "gfx110X_build");
        assert_eq!(config.architecture_groups.len(), 2);
        assert!(config.validation.error_on_duplicate_device_code);
        assert!(config.validation.error_on_missing_architecture);
        assert_eq!(
            config.architecture_groups["gfx110X"].architectures,
            vec!["gfx1100", "gfx1101"]
        );
    }

    #[test]
    fn missing_groups_are_rejected() {
        let file = write_config(r#"{ "primary_shard": "a", "architecture_groups": {} }"#);
        assert!(PackagingConfig::load(file.path()).is_err());
    }

    #[test]
    fn non_gfx_architecture_is_rejected() {
        let file = write_config(
            r#"{
                "primary_shard": "a",
                "architecture_groups": { "g": { "architectures": ["sm_90"] } }
            }"#,
        );
        let err = PackagingConfig::load(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("sm_90"));
    }
}
