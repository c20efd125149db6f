//! Run counters stored with each checkpoint.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const META_FILE: &str = "meta.json";

/// Counters needed to resume a run from a model folder.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CheckpointMeta {
    /// Environment steps at save time
    pub t_env: u64,
    /// Episodes completed at save time
    pub episode: u64,
    /// Experiment name
    pub name: String,
    /// entmix version that wrote the checkpoint
    pub version: String,
}

impl CheckpointMeta {
    pub fn new(t_env: u64, episode: u64, name: impl Into<String>) -> Self {
        Self {
            t_env,
            episode,
            name: name.into(),
            version: crate::VERSION.to_string(),
        }
    }

    /// Write `meta.json` into `dir`
    pub fn save(&self, dir: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(dir.join(META_FILE), text)?;
        Ok(())
    }

    /// Read `meta.json` from `dir`; `None` for folders written without one
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(META_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }
}
