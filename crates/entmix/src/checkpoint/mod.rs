//! Model checkpoints.
//!
//! Provides:
//! - `CheckpointManager` over a directory of timestep-named model folders
//! - `CheckpointMeta`, the run counters written next to the model files

mod manager;
mod state;

pub use manager::{CheckpointConfig, CheckpointManager};
pub use state::CheckpointMeta;
