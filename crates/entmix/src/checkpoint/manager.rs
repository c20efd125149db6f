//! Checkpoint manager over timestep-named model folders.

use super::state::CheckpointMeta;
use crate::learner::Learner;
use crate::{EntmixError, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Configuration for checkpoint management.
#[derive(Clone, Debug)]
pub struct CheckpointConfig {
    /// Directory holding one folder per saved timestep
    pub checkpoint_dir: PathBuf,
    /// Keep only the last N folders (0 = keep all)
    pub keep_last: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("models"),
            keep_last: 0,
        }
    }
}

impl CheckpointConfig {
    /// Create a new config with the given directory.
    pub fn new(checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.into(),
            ..Default::default()
        }
    }

    /// Set number of checkpoints to keep.
    pub fn keep_last(mut self, n: usize) -> Self {
        self.keep_last = n;
        self
    }
}

/// Manages a directory laid out as `<checkpoint_dir>/<t_env>/{agent.th, ...}`.
///
/// # Example
///
/// ```ignore
/// let manager = CheckpointManager::new(CheckpointConfig::new("results/models/run"));
///
/// // In training loop:
/// manager.save(&learner, t_env, &CheckpointMeta::new(t_env, episode, "run"))?;
///
/// // To resume from the latest (0) or closest timestep:
/// if let Some(t_env) = manager.load(&mut learner, 0, false)? {
///     println!("Resumed from t_env {}", t_env);
/// }
/// ```
pub struct CheckpointManager {
    config: CheckpointConfig,
}

impl CheckpointManager {
    pub fn new(config: CheckpointConfig) -> Self {
        Self { config }
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.config.checkpoint_dir
    }

    /// Save the learner into `<checkpoint_dir>/<t_env>` and rotate old folders.
    pub fn save<L: Learner + ?Sized>(
        &self,
        learner: &L,
        t_env: u64,
        meta: &CheckpointMeta,
    ) -> Result<PathBuf> {
        let path = self.config.checkpoint_dir.join(t_env.to_string());
        fs::create_dir_all(&path)?;
        learner.save_models(&path)?;
        meta.save(&path)?;
        tracing::info!(path = %path.display(), t_env, "Saving models");

        if self.config.keep_last > 0 {
            self.cleanup_old_checkpoints()?;
        }
        Ok(path)
    }

    /// Load the folder picked by [`resolve`](Self::resolve).
    ///
    /// Returns the loaded timestep, or `None` when there is nothing to load.
    pub fn load<L: Learner + ?Sized>(
        &self,
        learner: &mut L,
        load_step: u64,
        evaluate: bool,
    ) -> Result<Option<u64>> {
        match self.resolve(load_step)? {
            Some((t_env, path)) => {
                tracing::info!(path = %path.display(), t_env, "Loading model");
                learner.load_models(&path, evaluate)?;
                Ok(Some(t_env))
            }
            None => Ok(None),
        }
    }

    /// `load_step == 0` picks the largest timestep, anything else the
    /// closest one (ties go to the earlier folder).
    pub fn resolve(&self, load_step: u64) -> Result<Option<(u64, PathBuf)>> {
        let checkpoints = self.list_checkpoints()?;
        let chosen = if load_step == 0 {
            checkpoints.into_iter().last()
        } else {
            checkpoints
                .into_iter()
                .min_by_key(|(t, _)| t.abs_diff(load_step))
        };
        Ok(chosen)
    }

    /// Like [`resolve`](Self::resolve) but a missing checkpoint is an error
    pub fn require(&self, load_step: u64) -> Result<(u64, PathBuf)> {
        self.resolve(load_step)?.ok_or_else(|| {
            EntmixError::Checkpoint(format!(
                "no timestep folders under {}",
                self.config.checkpoint_dir.display()
            ))
        })
    }

    /// Numeric subfolders sorted by timestep. A missing directory is empty.
    pub fn list_checkpoints(&self) -> Result<Vec<(u64, PathBuf)>> {
        let entries = match fs::read_dir(&self.config.checkpoint_dir) {
            Ok(e) => e,
            Err(_) => return Ok(Vec::new()),
        };

        let mut checkpoints: Vec<(u64, PathBuf)> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .filter_map(|p| {
                let step = p.file_name()?.to_str()?.parse::<u64>().ok()?;
                Some((step, p))
            })
            .collect();

        checkpoints.sort_by_key(|(t, _)| *t);
        Ok(checkpoints)
    }

    /// Remove old folders, keeping only the last N.
    fn cleanup_old_checkpoints(&self) -> Result<()> {
        let mut checkpoints = self.list_checkpoints()?;

        while checkpoints.len() > self.config.keep_last {
            let (_, old) = checkpoints.remove(0);
            if let Err(e) = fs::remove_dir_all(&old) {
                tracing::warn!(path = %old.display(), "Failed to remove old checkpoint: {}", e);
            } else {
                tracing::debug!(path = %old.display(), "Removed old checkpoint");
            }
        }

        Ok(())
    }
}
