//! Run configuration
//!
//! A run is described by a small JSON file: where the sources live, their
//! load order, which names are aliases of which, and how writes behave.

use crate::alias::AliasTable;
use crate::backend::BackendKind;
use crate::error::{Error, Result};
use crate::formid::MasterPolicy;
use crate::store::Policy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Everything a run needs besides the patcher and the target
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Directory holding the source files
    pub data_dir: PathBuf,
    /// Source names, earliest first
    pub load_order: Vec<String>,
    #[serde(default, skip_serializing_if = "AliasTable::is_empty")]
    pub aliases: AliasTable,
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub master_policy: MasterPolicy,
    /// Override the patcher's own precedence policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<Policy>,
    /// Carry editor id renames into scripts when the patcher supports it
    #[serde(default = "default_true")]
    pub propagate_renames: bool,
    /// Where saved writes are journaled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journal: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

impl RunConfig {
    pub fn new(data_dir: impl Into<PathBuf>, load_order: Vec<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            load_order,
            propagate_renames: true,
            ..Self::default()
        }
    }

    /// Load a run configuration from JSON
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| Error::FileRead {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        serde_json::from_str(&content).map_err(Error::Json)
    }

    /// Save the run configuration to JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Load order up to and including `target`; the whole order when the
    /// target is not part of it
    pub fn sources_for(&self, target: &str) -> &[String] {
        match self.load_order.iter().position(|s| s == target) {
            Some(i) => &self.load_order[..=i],
            None => &self.load_order,
        }
    }
}
