//! `.kpm` component manifests.
//!
//! A component's manifest enumerates, per architecture, the kpack file that
//! carries its kernels. One manifest lives at
//! `<artifact>/<prefix>/.kpack/<component>.kpm` for every prefix that
//! contains device code.

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const KPM_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to read manifest '{}': {source}", path.display()))]
    ReadManifest { path: PathBuf, source: io::Error },

    #[snafu(display("invalid manifest '{}': {source}", path.display()))]
    ParseManifest {
        path: PathBuf,
        source: rmp_serde::decode::Error,
    },

    #[snafu(display("manifest '{}' is empty", path.display()))]
    EmptyManifest { path: PathBuf },

    #[snafu(display("failed to encode manifest: {source}"))]
    EncodeManifest { source: rmp_serde::encode::Error },

    #[snafu(display("failed to write manifest '{}': {source}", path.display()))]
    WriteManifest { path: PathBuf, source: io::Error },
}

/// One architecture's kpack file within a component manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KpackFileEntry {
    pub file: String,
    pub size: u64,
    pub kernel_count: u64,
}

/// A `.kpm` component manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackManifest {
    pub format_version: u32,
    pub component_name: String,
    pub prefix: String,
    /// Architecture → kpack file carrying that architecture's kernels.
    pub kpack_files: BTreeMap<String, KpackFileEntry>,
}

impl PackManifest {
    pub fn new(component_name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            format_version: KPM_FORMAT_VERSION,
            component_name: component_name.into(),
            prefix: prefix.into(),
            kpack_files: BTreeMap::new(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let bytes = fs::read(path).context(ReadManifestSnafu { path })?;
        snafu::ensure!(!bytes.is_empty(), EmptyManifestSnafu { path });
        rmp_serde::from_slice(&bytes).context(ParseManifestSnafu { path })
    }

    pub fn to_file(&self, path: &Path) -> Result<(), Error> {
        let bytes = rmp_serde::to_vec_named(self).context(EncodeManifestSnafu)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context(WriteManifestSnafu { path })?;
        }
        fs::write(path, bytes).context(WriteManifestSnafu { path })
    }
}
