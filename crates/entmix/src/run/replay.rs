//! Episode replay buffer.

use super::EpisodeSource;
use crate::batch::EpisodeBatch;
use crate::{EntmixError, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::VecDeque;
use tch::Tensor;

/// Ring of single-episode batches padded to a fixed horizon.
///
/// Once `capacity` episodes are held, inserting evicts the oldest.
/// Sampling draws distinct episodes uniformly.
pub struct ReplayBuffer {
    episodes: VecDeque<EpisodeBatch>,
    capacity: usize,
    max_seq_length: i64,
    episodes_in: u64,
    rng: StdRng,
}

impl ReplayBuffer {
    /// Buffer of `capacity` episodes of `max_seq_length` steps each
    pub fn new(capacity: usize, max_seq_length: i64) -> Self {
        Self::with_rng(capacity, max_seq_length, StdRng::from_entropy())
    }

    /// Deterministic sampling order
    pub fn with_seed(capacity: usize, max_seq_length: i64, seed: u64) -> Self {
        Self::with_rng(capacity, max_seq_length, StdRng::seed_from_u64(seed))
    }

    fn with_rng(capacity: usize, max_seq_length: i64, rng: StdRng) -> Self {
        Self {
            episodes: VecDeque::with_capacity(capacity),
            capacity,
            max_seq_length,
            episodes_in: 0,
            rng,
        }
    }

    pub fn len(&self) -> usize {
        self.episodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.episodes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_seq_length(&self) -> i64 {
        self.max_seq_length
    }

    /// Episodes inserted over the buffer's lifetime
    pub fn episodes_in(&self) -> u64 {
        self.episodes_in
    }

    /// Split `batch` into episodes, pad each to the buffer horizon and store it
    pub fn insert_episode_batch(&mut self, batch: &EpisodeBatch) -> Result<()> {
        if batch.max_seq_length() > self.max_seq_length {
            return Err(EntmixError::InvalidBatch(format!(
                "episodes of {} steps exceed the buffer horizon {}",
                batch.max_seq_length(),
                self.max_seq_length
            )));
        }
        if self.capacity == 0 {
            return Ok(());
        }
        for i in 0..batch.batch_size() {
            let index = Tensor::from_slice(&[i]);
            let episode = pad_time(&batch.select_episodes(&index), self.max_seq_length)?;
            if self.episodes.len() == self.capacity {
                self.episodes.pop_front();
            }
            self.episodes.push_back(episode);
            self.episodes_in += 1;
        }
        Ok(())
    }
}

impl EpisodeSource for ReplayBuffer {
    fn can_sample(&self, batch_size: usize) -> bool {
        batch_size > 0 && self.episodes.len() >= batch_size
    }

    fn sample(&mut self, batch_size: usize) -> Result<EpisodeBatch> {
        if !self.can_sample(batch_size) {
            return Err(EntmixError::InvalidBatch(format!(
                "cannot sample {} episodes from {}",
                batch_size,
                self.episodes.len()
            )));
        }
        let picked: Vec<EpisodeBatch> =
            rand::seq::index::sample(&mut self.rng, self.episodes.len(), batch_size)
                .into_iter()
                .map(|i| self.episodes[i].shallow_clone())
                .collect();
        EpisodeBatch::cat(&picked)
    }
}

/// Zero-pad every field of `batch` along time to `t` steps
fn pad_time(batch: &EpisodeBatch, t: i64) -> Result<EpisodeBatch> {
    let current = batch.max_seq_length();
    if current == t {
        return Ok(batch.shallow_clone());
    }
    let mut fields = Vec::new();
    for name in batch.field_names() {
        let value = batch.get(name)?;
        let mut size = value.size();
        size[1] = t;
        let padded = Tensor::zeros(size.as_slice(), (value.kind(), value.device()));
        padded.narrow(1, 0, current).copy_(value);
        fields.push((name.to_string(), padded));
    }
    EpisodeBatch::new(fields)
}
