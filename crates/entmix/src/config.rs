//! Experiment configuration.
//!
//! Every optional feature is a named, typed field with a default so a partial
//! JSON file deserializes cleanly.

use crate::nn::PoolingType;
use crate::{EntmixError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tch::Device;

/// Mixing network used to combine per-agent Q-values
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MixerKind {
    Vdn,
    Qmix,
    FlexQmix,
    LinFlexQmix,
    Wvdn,
}

impl MixerKind {
    /// Whether the mixer conditions on the entity set rather than a flat state
    pub fn requires_entity_scheme(&self) -> bool {
        matches!(
            self,
            MixerKind::FlexQmix | MixerKind::LinFlexQmix | MixerKind::Wvdn
        )
    }

    /// Whether the mixer can gate agent contributions with imagine groups
    pub fn supports_imagine(&self) -> bool {
        !matches!(self, MixerKind::Qmix)
    }
}

impl fmt::Display for MixerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MixerKind::Vdn => "vdn",
            MixerKind::Qmix => "qmix",
            MixerKind::FlexQmix => "flex_qmix",
            MixerKind::LinFlexQmix => "lin_flex_qmix",
            MixerKind::Wvdn => "wvdn",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for MixerKind {
    type Err = EntmixError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "vdn" => Ok(MixerKind::Vdn),
            "qmix" => Ok(MixerKind::Qmix),
            "flex_qmix" => Ok(MixerKind::FlexQmix),
            "lin_flex_qmix" => Ok(MixerKind::LinFlexQmix),
            "wvdn" => Ok(MixerKind::Wvdn),
            other => Err(EntmixError::Config(format!(
                "Mixer {} not recognised",
                other
            ))),
        }
    }
}

/// Configuration consumed by [`QLearner`](crate::learner::QLearner) and
/// [`MsgQLearner`](crate::learner::MsgQLearner)
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnerConfig {
    /// Mixing network
    pub mixer: MixerKind,
    /// Whether state is a maskable entity set (vs a flat state vector)
    pub entity_scheme: bool,
    /// Append one-hot last actions to agent entities fed to the mixer
    pub entity_last_action: bool,
    /// Select bootstrap actions with the live network
    pub double_q: bool,
    /// Discount factor
    pub gamma: f64,

    // RMSprop
    pub lr: f64,
    pub optim_alpha: f64,
    pub optim_eps: f64,
    pub weight_decay: f64,
    /// Global gradient norm bound
    pub grad_norm_clip: f64,

    /// Episodes between hard target updates
    pub target_update_interval: u64,
    /// Environment steps between metric emissions
    pub learner_log_interval: u64,

    /// Weight of the imagined (within/across group) loss
    pub lmbda: f64,
    /// Use ground-truth groups instead of random ones for the imagined loss
    pub train_gt_factors: bool,
    /// Log the in-group weight proportion under ground-truth groups
    pub test_gt_factors: bool,

    /// Penalise agent Qs that stray from the joint Q
    pub local_constraint: bool,
    pub local_constraint_weight: f64,
    /// Tolerance band of the local constraint
    pub q_tol: f64,
    /// Compare against the joint Q averaged over single-agent deviations
    pub ave_tot: bool,

    /// Offset (and elector chunk length) between producing and inferring messages
    #[serde(rename = "msg_T")]
    pub msg_t: i64,
    pub msg_entropy_weight: f64,
    pub msg_ce_weight: f64,
    pub ceb_weight: f64,
    pub ceb_kl_weight: f64,
    /// Disable every messaging loss term
    pub no_summary: bool,

    // Mixer architecture
    pub n_agents: i64,
    pub n_actions: i64,
    pub n_entities: i64,
    pub entity_shape: i64,
    pub state_shape: i64,
    pub mixing_embed_dim: i64,
    pub hypernet_embed: i64,
    pub attn_n_heads: i64,
    pub attn_embed_dim: i64,
    pub repeat_attn: i64,

    /// Device to train on
    #[serde(skip, default = "default_device")]
    pub device: Device,
}

fn default_device() -> Device {
    Device::Cpu
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            mixer: MixerKind::FlexQmix,
            entity_scheme: true,
            entity_last_action: true,
            double_q: true,
            gamma: 0.99,

            lr: 0.0005,
            optim_alpha: 0.99,
            optim_eps: 1e-5,
            weight_decay: 0.0,
            grad_norm_clip: 10.0,

            target_update_interval: 200,
            learner_log_interval: 10_000,

            lmbda: 0.5,
            train_gt_factors: false,
            test_gt_factors: false,

            local_constraint: false,
            local_constraint_weight: 0.1,
            q_tol: 0.0,
            ave_tot: false,

            msg_t: 2,
            msg_entropy_weight: 0.001,
            msg_ce_weight: 0.01,
            ceb_weight: 0.0,
            ceb_kl_weight: 0.0,
            no_summary: false,

            n_agents: 3,
            n_actions: 6,
            n_entities: 8,
            entity_shape: 10,
            state_shape: 32,
            mixing_embed_dim: 32,
            hypernet_embed: 64,
            attn_n_heads: 4,
            attn_embed_dim: 64,
            repeat_attn: 0,

            device: Device::Cpu,
        }
    }
}

impl LearnerConfig {
    /// Entity dimension seen by the mixer (entities plus optional last actions)
    pub fn mixer_entity_dim(&self) -> i64 {
        if self.entity_last_action {
            self.entity_shape + self.n_actions
        } else {
            self.entity_shape
        }
    }

    /// Reject inconsistent settings before any network is built
    pub fn validate(&self) -> Result<()> {
        if self.mixer.requires_entity_scheme() && !self.entity_scheme {
            return Err(EntmixError::Config(format!(
                "{} only available with entity scheme",
                self.mixer
            )));
        }
        if self.target_update_interval == 0 {
            return Err(EntmixError::Config(
                "target_update_interval must be at least 1".into(),
            ));
        }
        if self.msg_t < 1 {
            return Err(EntmixError::Config("msg_T must be at least 1".into()));
        }
        if self.ave_tot && self.local_constraint && self.entity_scheme {
            return Err(EntmixError::Config(
                "ave_tot is only implemented for the state scheme".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.lmbda) {
            return Err(EntmixError::Config(format!(
                "lmbda must lie in [0, 1], got {}",
                self.lmbda
            )));
        }
        if self.n_agents < 1 || self.n_actions < 1 {
            return Err(EntmixError::Config(
                "n_agents and n_actions must be positive".into(),
            ));
        }
        if self.entity_scheme && self.n_entities < self.n_agents {
            return Err(EntmixError::Config(format!(
                "n_entities ({}) must cover the {} agents",
                self.n_entities, self.n_agents
            )));
        }
        Ok(())
    }
}

/// Configuration for [`EntityAttentionAgent`](crate::agent::EntityAttentionAgent)
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub entity_shape: i64,
    pub n_agents: i64,
    pub n_actions: i64,
    pub attn_embed_dim: i64,
    pub attn_n_heads: i64,
    pub rnn_hidden_dim: i64,
    /// Per-agent observation width for [`MlpAgent`](crate::agent::MlpAgent)
    pub obs_shape: i64,
    /// Extra entity-to-entity attention passes before the agent pass
    pub repeat_attn: i64,
    /// Keep only this fraction of the strongest entities per pass
    pub rank_percent: Option<f64>,
    /// Pool the entity set in the agent pass instead of attending
    pub pooling: Option<PoolingType>,
    /// Message dimension; `None` disables the message encoder
    pub msg_dim: Option<i64>,
    /// Append one-hot last actions to agent entities
    pub entity_last_action: bool,
    /// Produce within/across group Q-values during training
    pub imagine: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            entity_shape: 10,
            n_agents: 3,
            n_actions: 6,
            attn_embed_dim: 64,
            attn_n_heads: 4,
            rnn_hidden_dim: 64,
            obs_shape: 32,
            repeat_attn: 0,
            rank_percent: None,
            pooling: None,
            msg_dim: None,
            entity_last_action: true,
            imagine: false,
        }
    }
}

impl AgentConfig {
    /// Input width of the entity encoder
    pub fn input_dim(&self) -> i64 {
        if self.entity_last_action {
            self.entity_shape + self.n_actions
        } else {
            self.entity_shape
        }
    }
}

/// Outer loop configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Episodes per training batch
    pub batch_size: usize,
    /// Episodes held by the replay buffer
    pub buffer_size: usize,
    /// Episode horizon; batches have `episode_limit + 1` steps
    pub episode_limit: i64,
    /// Learner updates per collected batch
    pub training_iters: usize,
    /// Total environment steps
    pub t_max: u64,
    pub save_model: bool,
    /// Environment steps between model saves
    pub save_model_interval: u64,
    /// Environment steps between progress summaries
    pub log_interval: u64,
    pub local_results_path: String,
    /// Directory of timestep-named model folders to resume from
    pub checkpoint_path: String,
    /// 0 loads the latest timestep, anything else the closest one
    pub load_step: u64,
    /// Load without optimizer/mixer state
    pub evaluate: bool,
    pub seed: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            buffer_size: 5000,
            episode_limit: 60,
            training_iters: 1,
            t_max: 2_000_000,
            save_model: false,
            save_model_interval: 500_000,
            log_interval: 10_000,
            local_results_path: "results".to_string(),
            checkpoint_path: String::new(),
            load_step: 0,
            evaluate: false,
            seed: 42,
        }
    }
}

/// Complete experiment description
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub name: String,
    pub learner: LearnerConfig,
    pub agent: AgentConfig,
    pub run: RunConfig,
}

impl ExperimentConfig {
    /// Read a JSON config; missing keys take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config as pretty JSON
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Validate the learner config and its agreement with the agent config
    pub fn validate(&self) -> Result<()> {
        self.learner.validate()?;
        if self.agent.n_agents != self.learner.n_agents
            || self.agent.n_actions != self.learner.n_actions
        {
            return Err(EntmixError::Config(
                "agent and learner disagree on n_agents/n_actions".into(),
            ));
        }
        for (name, learner, agent) in [
            ("attn_embed_dim", self.learner.attn_embed_dim, self.agent.attn_embed_dim),
            ("attn_n_heads", self.learner.attn_n_heads, self.agent.attn_n_heads),
            ("repeat_attn", self.learner.repeat_attn, self.agent.repeat_attn),
        ] {
            if learner != agent {
                return Err(EntmixError::Config(format!(
                    "learner.{} ({}) disagrees with agent.{} ({})",
                    name, learner, name, agent
                )));
            }
        }
        if self.agent.imagine && !self.learner.mixer.supports_imagine() {
            return Err(EntmixError::Config(format!(
                "{} cannot mix imagined groups",
                self.learner.mixer
            )));
        }
        Ok(())
    }
}
