//! Per-agent Q networks and the message-sender elector.
//!
//! Learners only see agents through [`AgentNetwork`], so any network that
//! maps an [`EpisodeBatch`] to per-agent Qs can be trained. The learners
//! build live and target agents from the same factory closure and keep
//! them in sync by copying parameters.

mod elector;
mod entity_attention;
mod mlp;

pub use elector::AttentionElector;
pub use entity_attention::EntityAttentionAgent;
pub use mlp::MlpAgent;

use crate::batch::EpisodeBatch;
use crate::nn::Distribution;
use crate::Result;
use tch::Tensor;

/// Options for one agent forward pass over a whole batch
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ForwardMode {
    /// Also compute within-group and across-group Qs
    pub imagine: bool,
    /// Split groups with the batch's `gt_mask` instead of at random
    pub gt_factors: bool,
    /// Also return message distributions
    pub messages: bool,
}

impl ForwardMode {
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn imagine(gt_factors: bool) -> Self {
        Self {
            imagine: true,
            gt_factors,
            messages: false,
        }
    }

    pub fn with_messages(mut self) -> Self {
        self.messages = true;
        self
    }
}

/// Group exclusion masks `[B, T, na, ne]`, 1 = interaction excluded
pub struct ImagineGroups {
    pub within: Tensor,
    pub across: Tensor,
}

impl ImagineGroups {
    pub fn narrow_time(&self, start: i64, len: i64) -> Self {
        Self {
            within: self.within.narrow(1, start, len),
            across: self.across.narrow(1, start, len),
        }
    }
}

/// Per-agent Q-values `[B, T, na, n_actions]`
pub enum QValues {
    Plain(Tensor),
    Imagined {
        full: Tensor,
        within_group: Tensor,
        across_group: Tensor,
        groups: ImagineGroups,
    },
}

impl QValues {
    /// Qs computed with the full observation
    pub fn full(&self) -> &Tensor {
        match self {
            Self::Plain(q) => q,
            Self::Imagined { full, .. } => full,
        }
    }
}

/// Producing and inferring message distributions, each `[B, T, na, msg_dim]`
pub struct MessageDistributions {
    pub producing: Distribution,
    pub inferring: Distribution,
}

pub struct AgentForward {
    pub q: QValues,
    pub messages: Option<MessageDistributions>,
}

/// Trait for networks producing per-agent Q-values for a batch of episodes
pub trait AgentNetwork {
    fn forward(&self, batch: &EpisodeBatch, mode: ForwardMode) -> Result<AgentForward>;

    /// Whether `ForwardMode::imagine` is honoured
    fn supports_imagine(&self) -> bool {
        false
    }

    /// Whether `ForwardMode::messages` is honoured
    fn produces_messages(&self) -> bool {
        false
    }
}

/// Trait for the policy choosing which agent broadcasts
pub trait Elector {
    /// Log-probabilities over senders `[B, T, na]`
    fn log_probs(&self, batch: &EpisodeBatch) -> Result<Tensor>;
}
