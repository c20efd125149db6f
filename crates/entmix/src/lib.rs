//! # entmix
//!
//! Value-decomposition multi-agent Q-learning over variable-size entity sets.
//!
//! ## Overview
//!
//! entmix provides:
//! - `EpisodeBatch`, the `[batch, time, ...]` tensor mapping consumed by learners
//! - `EntityAttentionLayer` / `EntityPoolingLayer` over maskable entity sets
//! - Monotonic mixers (`vdn`, `qmix`, `flex_qmix`, `lin_flex_qmix`, `wvdn`)
//! - `QLearner` with double-Q targets, imagined group credit assignment and
//!   a local consistency constraint
//! - `MsgQLearner`, which adds an information-bottleneck messaging loss and a
//!   REINFORCE-trained elector choosing message senders
//! - An outer training loop, replay buffer, checkpoints and metric loggers
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use entmix::prelude::*;
//!
//! let config = ExperimentConfig::default();
//! let agent_cfg = config.agent.clone();
//! let mut learner = QLearner::new(
//!     move |path| EntityAttentionAgent::new(path, &agent_cfg),
//!     config.learner.clone(),
//!     std::sync::Arc::new(ConsoleLogger::new()),
//! )?;
//!
//! let batch = SyntheticBatch::entity(4, 10, 3, 6, 8, 5).build(tch::Device::Cpu)?;
//! learner.train(&batch, 0, 0)?;
//! ```

pub mod agent;
pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod learner;
pub mod log;
pub mod mixer;
pub mod nn;
pub mod run;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::agent::{
        AgentForward, AgentNetwork, AttentionElector, Elector, EntityAttentionAgent,
        ForwardMode, ImagineGroups, MessageDistributions, MlpAgent, QValues,
    };
    pub use crate::batch::{EpisodeBatch, SyntheticBatch};
    pub use crate::checkpoint::CheckpointManager;
    pub use crate::config::{AgentConfig, ExperimentConfig, LearnerConfig, MixerKind, RunConfig};
    pub use crate::learner::{Learner, MsgQLearner, QLearner};
    pub use crate::log::{CompositeLogger, ConsoleLogger, MetricLogger, NoOpLogger, RecordingLogger};
    #[cfg(feature = "tensorboard")]
    pub use crate::log::TensorBoardLogger;
    pub use crate::mixer::{build_mixer, Mixer, MixerInput};
    pub use crate::nn::{EntityAttentionLayer, EntityPoolingLayer, PoolingType};
    pub use crate::run::{EpisodeSource, ReplayBuffer, TrainingLoop};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error types for the library
#[derive(Debug, thiserror::Error)]
pub enum EntmixError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Batch is missing field `{0}`")]
    MissingField(String),

    #[error("Shape mismatch for `{field}`: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        field: String,
        expected: Vec<i64>,
        actual: Vec<i64>,
    },

    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Tensor error: {0}")]
    Tensor(#[from] tch::TchError),
}

pub type Result<T> = core::result::Result<T, EntmixError>;
