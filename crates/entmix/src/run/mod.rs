//! Outer training loop.
//!
//! Provides:
//! - `EpisodeSource` trait for anything that yields episode batches
//! - `ReplayBuffer`, an in-memory ring of padded episodes
//! - `TrainingLoop`, which samples, trains, saves and reports progress

mod replay;
mod training_loop;

pub use replay::ReplayBuffer;
pub use training_loop::TrainingLoop;

use crate::batch::EpisodeBatch;
use crate::Result;

/// Source of training batches
pub trait EpisodeSource {
    /// Whether `batch_size` episodes can be drawn
    fn can_sample(&self, batch_size: usize) -> bool;

    /// Draw `batch_size` episodes
    fn sample(&mut self, batch_size: usize) -> Result<EpisodeBatch>;
}
