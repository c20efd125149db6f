use super::Elector;
use crate::batch::{fields, EpisodeBatch};
use crate::config::AgentConfig;
use crate::nn::EntityAttentionLayer;
use crate::Result;
use tch::{nn, nn::Module, Kind, Tensor};

/// Categorical policy over which agent broadcasts its message.
///
/// Each agent attends over the entities it observes and is scored; absent
/// agents get (effectively) zero probability.
#[derive(Debug)]
pub struct AttentionElector {
    fc1: nn::Linear,
    attn: EntityAttentionLayer,
    fc2: nn::Linear,
    n_agents: i64,
    n_actions: i64,
    entity_last_action: bool,
}

impl AttentionElector {
    pub fn new(path: nn::Path, cfg: &AgentConfig) -> Result<Self> {
        let embed = cfg.attn_embed_dim;
        Ok(Self {
            fc1: nn::linear(&path / "fc1", cfg.input_dim(), embed, Default::default()),
            attn: EntityAttentionLayer::new(&path / "attn", embed, embed, embed, cfg.attn_n_heads)?,
            fc2: nn::linear(&path / "fc2", embed, 1, Default::default()),
            n_agents: cfg.n_agents,
            n_actions: cfg.n_actions,
            entity_last_action: cfg.entity_last_action,
        })
    }
}

impl Elector for AttentionElector {
    fn log_probs(&self, batch: &EpisodeBatch) -> Result<Tensor> {
        let entities = if self.entity_last_action {
            batch.entities_with_last_action(self.n_agents, self.n_actions)?
        } else {
            batch.get_float(fields::ENTITIES)?
        };
        let size = entities.size();
        let (b, t, ne, ed) = (size[0], size[1], size[2], size[3]);
        let na = self.n_agents;

        let obs_mask = batch.get_float(fields::OBS_MASK)?.reshape([b * t, ne, ne]);
        let agent_mask = batch
            .get_float(fields::ENTITY_MASK)?
            .reshape([b * t, ne])
            .narrow(1, 0, na);

        let x = self.fc1.forward(&entities.reshape([b * t, ne, ed])).relu();
        let x = self.attn.forward(&x, Some(&obs_mask), &agent_mask);
        let logits = self
            .fc2
            .forward(&x)
            .squeeze_dim(-1)
            // finite so a step without agents stays uniform instead of NaN
            .masked_fill(&agent_mask.gt(0.5), -1e9);

        Ok(logits.log_softmax(-1, Kind::Float).reshape([b, t, na]))
    }
}
