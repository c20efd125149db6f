//! Sampling, training and saving on the environment-step clock.

use super::EpisodeSource;
use crate::checkpoint::{CheckpointConfig, CheckpointManager, CheckpointMeta};
use crate::config::RunConfig;
use crate::learner::Learner;
use crate::log::RecordingLogger;
use crate::utils::{abbreviate, format_duration, time_left};
use crate::Result;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tch::Device;
use tracing::{debug, info};

/// Drives a [`Learner`] from an [`EpisodeSource`].
///
/// Environment interaction happens elsewhere; callers report collected
/// episodes with [`record_episodes`](Self::record_episodes) and then call
/// [`train_iteration`](Self::train_iteration) and
/// [`maybe_save`](Self::maybe_save).
pub struct TrainingLoop<L> {
    learner: L,
    config: RunConfig,
    token: String,
    device: Device,
    t_env: u64,
    episode: u64,
    last_save_t: Option<u64>,
    last_log_t: u64,
    last_log_time: Instant,
    start_time: Instant,
    progress: Option<ProgressBar>,
    stats: Option<Arc<RecordingLogger>>,
}

impl<L: Learner> TrainingLoop<L> {
    /// `token` names this run's model folder under `<local_results_path>/models`
    pub fn new(learner: L, config: RunConfig, token: impl Into<String>, device: Device) -> Self {
        Self {
            learner,
            config,
            token: token.into(),
            device,
            t_env: 0,
            episode: 0,
            last_save_t: None,
            last_log_t: 0,
            last_log_time: Instant::now(),
            start_time: Instant::now(),
            progress: None,
            stats: None,
        }
    }

    /// Show a progress bar over `t_max` environment steps
    pub fn with_progress(mut self) -> Self {
        let pb = ProgressBar::new(self.config.t_max);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        self.progress = Some(pb);
        self
    }

    /// Print the recent statistics of `stats` with every progress report
    pub fn with_stats(mut self, stats: Arc<RecordingLogger>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn learner(&self) -> &L {
        &self.learner
    }

    pub fn learner_mut(&mut self) -> &mut L {
        &mut self.learner
    }

    pub fn t_env(&self) -> u64 {
        self.t_env
    }

    pub fn episode(&self) -> u64 {
        self.episode
    }

    /// Whether `t_max` environment steps have been reached
    pub fn is_done(&self) -> bool {
        self.t_env >= self.config.t_max
    }

    /// Folder this run saves timestep folders into
    pub fn models_dir(&self) -> PathBuf {
        Path::new(&self.config.local_results_path)
            .join("models")
            .join(&self.token)
    }

    /// Restore from `checkpoint_path` if one is configured.
    ///
    /// Returns the loaded timestep. Counters resume from it unless
    /// `evaluate` is set.
    pub fn resume(&mut self) -> Result<Option<u64>> {
        if self.config.checkpoint_path.is_empty() {
            return Ok(None);
        }
        let manager = CheckpointManager::new(CheckpointConfig::new(&self.config.checkpoint_path));
        let (t_env, path) = manager.require(self.config.load_step)?;
        info!(path = %path.display(), t_env, "Loading model");
        self.learner.load_models(&path, self.config.evaluate)?;

        if !self.config.evaluate {
            self.t_env = t_env;
            self.episode = CheckpointMeta::load(&path)?.map_or(0, |meta| meta.episode);
            self.last_save_t = Some(t_env);
            self.last_log_t = t_env;
        }
        Ok(Some(t_env))
    }

    /// Advance the clocks after collecting `episodes` episodes of `steps`
    /// environment steps in total
    pub fn record_episodes(&mut self, episodes: u64, steps: u64) {
        self.episode += episodes;
        self.t_env += steps;
        if let Some(pb) = &self.progress {
            pb.set_position(self.t_env.min(self.config.t_max));
        }
    }

    /// `training_iters` learner updates on freshly sampled batches.
    ///
    /// Returns whether any update ran; nothing happens until the source can
    /// supply `batch_size` episodes.
    pub fn train_iteration(&mut self, source: &mut dyn EpisodeSource) -> Result<bool> {
        if !source.can_sample(self.config.batch_size) {
            debug!(
                batch_size = self.config.batch_size,
                "Not enough episodes to sample yet"
            );
            return Ok(false);
        }
        for _ in 0..self.config.training_iters {
            let mut batch = source.sample(self.config.batch_size)?;
            let max_t = batch.max_t_filled()?;
            batch = batch.truncate(max_t)?;
            batch.to_device(self.device);

            self.learner.train(&batch, self.t_env, self.episode)?;
            self.learner.train_elector(&batch, self.t_env, self.episode)?;
        }
        Ok(true)
    }

    /// Save on the first call and every `save_model_interval` environment steps
    pub fn maybe_save(&mut self) -> Result<Option<PathBuf>> {
        if !self.config.save_model {
            return Ok(None);
        }
        let due = match self.last_save_t {
            None => true,
            Some(last) => self.t_env.saturating_sub(last) >= self.config.save_model_interval,
        };
        if !due {
            return Ok(None);
        }
        let manager = CheckpointManager::new(CheckpointConfig::new(self.models_dir()));
        let meta = CheckpointMeta::new(self.t_env, self.episode, self.token.clone());
        let path = manager.save(&self.learner, self.t_env, &meta)?;
        self.last_save_t = Some(self.t_env);
        Ok(Some(path))
    }

    /// Report progress every `log_interval` environment steps
    pub fn maybe_log_progress(&mut self) {
        if self.t_env.saturating_sub(self.last_log_t) < self.config.log_interval {
            return;
        }
        let elapsed = self.last_log_time.elapsed().as_secs_f64();
        info!(
            "t_env: {} / {}, episode: {}",
            abbreviate(self.t_env),
            abbreviate(self.config.t_max),
            self.episode
        );
        info!(
            "Estimated time left: {}. Time passed: {}",
            time_left(elapsed, self.last_log_t, self.t_env, self.config.t_max),
            format_duration(self.start_time.elapsed().as_secs_f64())
        );
        if let Some(stats) = &self.stats {
            info!("{}", stats.summary(self.t_env));
        }
        if let Some(pb) = &self.progress {
            pb.set_message(format!("episode {}", self.episode));
        }
        self.last_log_t = self.t_env;
        self.last_log_time = Instant::now();
    }

    /// Stop the progress bar and hand the learner back
    pub fn finish(self) -> L {
        if let Some(pb) = &self.progress {
            pb.finish_with_message("done");
        }
        info!(
            t_env = self.t_env,
            episode = self.episode,
            "Finished Training in {}",
            format_duration(self.start_time.elapsed().as_secs_f64())
        );
        self.learner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{EpisodeBatch, SyntheticBatch};
    use crate::run::ReplayBuffer;
    use std::fs;

    /// Learner recording the horizon and clocks of every call
    #[derive(Default)]
    struct CountingLearner {
        trained: Vec<(i64, u64, u64)>,
        elector_calls: Vec<(u64, u64)>,
        loaded: Vec<(PathBuf, bool)>,
    }

    impl Learner for CountingLearner {
        fn train(&mut self, batch: &EpisodeBatch, t_env: u64, episode_num: u64) -> Result<()> {
            self.trained.push((batch.max_seq_length(), t_env, episode_num));
            Ok(())
        }

        fn train_elector(&mut self, _batch: &EpisodeBatch, t_env: u64, episode_num: u64) -> Result<()> {
            self.elector_calls.push((t_env, episode_num));
            Ok(())
        }

        fn save_models(&self, dir: &Path) -> Result<()> {
            fs::write(dir.join("agent.th"), b"")?;
            Ok(())
        }

        fn load_models(&mut self, dir: &Path, evaluate: bool) -> Result<()> {
            self.loaded.push((dir.to_path_buf(), evaluate));
            Ok(())
        }
    }

    fn config(results: &Path) -> RunConfig {
        RunConfig {
            batch_size: 2,
            training_iters: 2,
            save_model: true,
            save_model_interval: 100,
            local_results_path: results.to_string_lossy().into_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn test_train_iteration_truncates_to_filled() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = TrainingLoop::new(CountingLearner::default(), config(dir.path()), "run", Device::Cpu);
        let mut buffer = ReplayBuffer::with_seed(10, 8, 1);

        assert!(!run.train_iteration(&mut buffer).unwrap());

        let batch = SyntheticBatch::state(3, 3, 2, 3, 4)
            .with_filled(vec![2, 4, 3])
            .build(Device::Cpu)
            .unwrap();
        buffer.insert_episode_batch(&batch).unwrap();
        run.record_episodes(3, 9);

        assert!(run.train_iteration(&mut buffer).unwrap());
        let learner = run.finish();
        assert_eq!(learner.trained.len(), 2);
        assert_eq!(learner.elector_calls, vec![(9, 3), (9, 3)]);
        for (t, t_env, episode) in learner.trained {
            assert!(t <= 4);
            assert_eq!((t_env, episode), (9, 3));
        }
    }

    #[test]
    fn test_maybe_save_cadence() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = TrainingLoop::new(CountingLearner::default(), config(dir.path()), "run", Device::Cpu);

        let first = run.maybe_save().unwrap().unwrap();
        assert!(first.ends_with("models/run/0"));
        run.record_episodes(1, 50);
        assert!(run.maybe_save().unwrap().is_none());
        run.record_episodes(1, 50);
        let second = run.maybe_save().unwrap().unwrap();
        assert!(second.join("agent.th").exists());
        assert_eq!(CheckpointMeta::load(&second).unwrap().unwrap().episode, 2);
    }

    #[test]
    fn test_resume_restores_counters() {
        let dir = tempfile::tempdir().unwrap();
        let models = dir.path().join("models").join("old");
        for (t, episode) in [(100u64, 4u64), (200, 9)] {
            let path = models.join(t.to_string());
            fs::create_dir_all(&path).unwrap();
            CheckpointMeta::new(t, episode, "old").save(&path).unwrap();
        }

        let mut cfg = config(dir.path());
        cfg.checkpoint_path = models.to_string_lossy().into_owned();
        cfg.load_step = 120;
        let mut run = TrainingLoop::new(CountingLearner::default(), cfg, "new", Device::Cpu);

        assert_eq!(run.resume().unwrap(), Some(100));
        assert_eq!(run.t_env(), 100);
        assert_eq!(run.episode(), 4);
        assert!(!run.learner().loaded[0].1);
    }

    #[test]
    fn test_resume_without_checkpoints_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.checkpoint_path = dir.path().join("nothing").to_string_lossy().into_owned();
        let mut run = TrainingLoop::new(CountingLearner::default(), cfg, "new", Device::Cpu);
        assert!(run.resume().is_err());
    }
}
