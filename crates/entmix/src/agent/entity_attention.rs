//! Recurrent entity-attention Q network.

use super::{AgentForward, AgentNetwork, ForwardMode, ImagineGroups, MessageDistributions, QValues};
use crate::batch::{fields, EpisodeBatch};
use crate::config::AgentConfig;
use crate::nn::{pair_mask, AttentionOptions, Distribution, EntityAttentionLayer, EntityPoolingLayer};
use crate::{EntmixError, Result};
use tch::{nn, nn::Module, nn::RNN, Kind, Tensor};

const MIN_STD: f64 = 1e-3;

#[derive(Debug)]
struct MessageHeads {
    produce: nn::Linear,
    infer: nn::Linear,
    msg_dim: i64,
}

impl MessageHeads {
    fn gaussian(&self, head: &nn::Linear, x: &Tensor) -> Distribution {
        let out = head.forward(x);
        let mean = out.narrow(-1, 0, self.msg_dim);
        let std = out.narrow(-1, self.msg_dim, self.msg_dim).softplus() + MIN_STD;
        Distribution::gaussian(mean, std)
    }
}

/// Agent-query pass: attention, or pooling when `AgentConfig::pooling` is set
#[derive(Debug)]
enum AgentPass {
    Attention(EntityAttentionLayer),
    Pooling(EntityPoolingLayer),
}

/// fc → entity attention (agent queries) → GRU over time → Q head.
///
/// With `pooling` the agent queries pool the entity set instead of attending.
/// With `repeat_attn > 0` the entity set first attends to itself that many
/// times. With `rank_percent` each pass keeps only the strongest entities and
/// hands its refined mask to the next pass. With `msg_dim` the Q head also
/// reads `head_message`, and producing / inferring message distributions are
/// available from the hidden state.
#[derive(Debug)]
pub struct EntityAttentionAgent {
    fc1: nn::Linear,
    entity_attn: Option<EntityAttentionLayer>,
    attn: AgentPass,
    rnn: nn::GRU,
    fc2: nn::Linear,
    msg: Option<MessageHeads>,
    cfg: AgentConfig,
}

impl EntityAttentionAgent {
    pub fn new(path: nn::Path, cfg: &AgentConfig) -> Result<Self> {
        let (embed, hidden) = (cfg.attn_embed_dim, cfg.rnn_hidden_dim);
        let entity_attn = if cfg.repeat_attn > 0 {
            Some(EntityAttentionLayer::new(
                &path / "entity_attn",
                embed,
                embed,
                embed,
                cfg.attn_n_heads,
            )?)
        } else {
            None
        };
        let msg = cfg.msg_dim.map(|md| MessageHeads {
            produce: nn::linear(&path / "msg_produce", hidden, 2 * md, Default::default()),
            infer: nn::linear(&path / "msg_infer", hidden + md, 2 * md, Default::default()),
            msg_dim: md,
        });
        let q_in = hidden + cfg.msg_dim.unwrap_or(0);
        let attn = match cfg.pooling {
            Some(pooling) => AgentPass::Pooling(EntityPoolingLayer::new(
                &path / "pool",
                embed,
                embed,
                hidden,
                pooling,
            )),
            None => AgentPass::Attention(EntityAttentionLayer::new(
                &path / "attn",
                embed,
                embed,
                hidden,
                cfg.attn_n_heads,
            )?),
        };

        Ok(Self {
            fc1: nn::linear(&path / "fc1", cfg.input_dim(), embed, Default::default()),
            entity_attn,
            attn,
            rnn: nn::gru(
                &path / "rnn",
                hidden,
                hidden,
                nn::RNNConfig {
                    batch_first: true,
                    ..Default::default()
                },
            ),
            fc2: nn::linear(&path / "fc2", q_in, cfg.n_actions, Default::default()),
            msg,
            cfg: cfg.clone(),
        })
    }

    fn attend(
        &self,
        layer: &EntityAttentionLayer,
        x: &Tensor,
        pre_mask: &Tensor,
        post_mask: &Tensor,
        entity_mask: &Tensor,
    ) -> Result<(Tensor, Option<Tensor>)> {
        match self.cfg.rank_percent {
            None => Ok((layer.forward(x, Some(pre_mask), post_mask), None)),
            Some(r) => {
                let out = layer.forward_with(
                    x,
                    Some(pre_mask),
                    post_mask,
                    AttentionOptions {
                        rank_percent: Some(r),
                        entity_mask: Some(entity_mask),
                        ..Default::default()
                    },
                )?;
                Ok((out.out, out.refined_mask))
            }
        }
    }

    /// Returns Qs `[B, T, na, n_actions]` and GRU outputs `[B, T, na, hidden]`
    fn q_pass(
        &self,
        entities: &Tensor,
        obs_mask: &Tensor,
        entity_mask: &Tensor,
        head_message: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        let size = entities.size();
        let (b, t, ne, ed) = (size[0], size[1], size[2], size[3]);
        let (na, hidden) = (self.cfg.n_agents, self.cfg.rnn_hidden_dim);

        let mut x = self.fc1.forward(&entities.reshape([b * t, ne, ed])).relu();
        let mut pre_mask = obs_mask.reshape([b * t, ne, ne]);
        let entity_mask = entity_mask.reshape([b * t, ne]);
        let agent_mask = entity_mask.narrow(1, 0, na);

        if let Some(layer) = &self.entity_attn {
            for _ in 0..self.cfg.repeat_attn {
                let (out, refined) = self.attend(layer, &x, &pre_mask, &entity_mask, &entity_mask)?;
                x = out;
                if let Some(refined) = refined {
                    pre_mask = refined;
                }
            }
        }
        let x2 = match &self.attn {
            AgentPass::Attention(layer) => self.attend(layer, &x, &pre_mask, &agent_mask, &entity_mask)?.0,
            AgentPass::Pooling(layer) => layer.forward(&x, Some(&pre_mask), &agent_mask),
        };

        let seq = x2
            .reshape([b, t, na, hidden])
            .permute([0, 2, 1, 3])
            .reshape([b * na, t, hidden]);
        let (out, _) = self.rnn.seq(&seq);
        let hs = out.reshape([b, na, t, hidden]).permute([0, 2, 1, 3]);

        let q_in = match head_message {
            Some(msg) => Tensor::cat(&[hs.shallow_clone(), msg.shallow_clone()], 3),
            None => hs.shallow_clone(),
        };
        let q = self
            .fc2
            .forward(&q_in)
            .masked_fill(&agent_mask.reshape([b, t, na, 1]).gt(0.5), 0.0);
        Ok((q, hs))
    }

    /// Full-size group exclusion masks `[B, T, ne, ne]` (within, across).
    fn groups(&self, batch: &EpisodeBatch, entity_mask: &Tensor, gt_factors: bool) -> Result<(Tensor, Tensor)> {
        let size = entity_mask.size();
        let (b, t, ne) = (size[0], size[1], size[2]);
        let na = self.cfg.n_agents;
        let opts = (Kind::Float, entity_mask.device());
        let invalid = pair_mask(entity_mask);

        if gt_factors {
            // agent rows come from the ground truth; other entities are unrestricted
            let other = batch.get_float(fields::GT_MASK)?;
            let rest = Tensor::zeros([b, t, ne - na, ne], opts);
            let within = Tensor::cat(&[other.shallow_clone(), rest.shallow_clone()], 2);
            let across = Tensor::cat(&[1.0 - other, rest], 2);
            return Ok((
                (within + &invalid).clamp_max(1.0),
                (across + &invalid).clamp_max(1.0),
            ));
        }

        // one random split per episode, kept for every step
        let in_a = Tensor::rand([b, 1, ne], opts)
            .lt_tensor(&Tensor::rand([b, 1, 1], opts))
            .to_kind(Kind::Float);
        let same = 1.0 - (in_a.unsqueeze(3) - in_a.unsqueeze(2)).abs();
        let valid = 1.0 - invalid;
        let within = 1.0 - &same * &valid;
        let across = 1.0 - (1.0 - same) * valid;
        Ok((within, across))
    }

    fn head_message(&self, batch: &EpisodeBatch) -> Result<Option<Tensor>> {
        match &self.msg {
            Some(_) => Ok(Some(batch.get_float(fields::HEAD_MESSAGE)?)),
            None => Ok(None),
        }
    }

    fn message_distributions(&self, hs: &Tensor, head_message: Option<&Tensor>) -> Result<MessageDistributions> {
        let (heads, msg) = match (&self.msg, head_message) {
            (Some(heads), Some(msg)) => (heads, msg),
            _ => {
                return Err(EntmixError::Config(
                    "agent has no message encoder (set msg_dim)".into(),
                ))
            }
        };
        Ok(MessageDistributions {
            producing: heads.gaussian(&heads.produce, hs),
            inferring: heads.gaussian(&heads.infer, &Tensor::cat(&[hs.shallow_clone(), msg.shallow_clone()], 3)),
        })
    }
}

impl AgentNetwork for EntityAttentionAgent {
    fn forward(&self, batch: &EpisodeBatch, mode: ForwardMode) -> Result<AgentForward> {
        let entities = if self.cfg.entity_last_action {
            batch.entities_with_last_action(self.cfg.n_agents, self.cfg.n_actions)?
        } else {
            batch.get_float(fields::ENTITIES)?
        };
        let obs_mask = batch.get_float(fields::OBS_MASK)?;
        let entity_mask = batch.get_float(fields::ENTITY_MASK)?;
        let head_message = self.head_message(batch)?;

        if !mode.imagine {
            let (q, hs) = self.q_pass(&entities, &obs_mask, &entity_mask, head_message.as_ref())?;
            let messages = if mode.messages {
                Some(self.message_distributions(&hs, head_message.as_ref())?)
            } else {
                None
            };
            return Ok(AgentForward {
                q: QValues::Plain(q),
                messages,
            });
        }

        if !self.cfg.imagine {
            return Err(EntmixError::Config(
                "imagine forward requested from an agent built without imagine".into(),
            ));
        }

        let (within, across) = self.groups(batch, &entity_mask, mode.gt_factors)?;
        let b = entities.size()[0];
        let na = self.cfg.n_agents;

        // full, within-group and across-group passes share one batched call
        let obs_all = Tensor::cat(
            &[
                obs_mask.shallow_clone(),
                (&within + &obs_mask).clamp_max(1.0),
                (&across + &obs_mask).clamp_max(1.0),
            ],
            0,
        );
        let msg_all = head_message.as_ref().map(|m| m.repeat([3, 1, 1, 1]));
        let (q_all, hs_all) = self.q_pass(
            &entities.repeat([3, 1, 1, 1]),
            &obs_all,
            &entity_mask.repeat([3, 1, 1]),
            msg_all.as_ref(),
        )?;

        let messages = if mode.messages {
            Some(self.message_distributions(&hs_all.narrow(0, 0, b), head_message.as_ref())?)
        } else {
            None
        };

        Ok(AgentForward {
            q: QValues::Imagined {
                full: q_all.narrow(0, 0, b),
                within_group: q_all.narrow(0, b, b),
                across_group: q_all.narrow(0, 2 * b, b),
                groups: ImagineGroups {
                    within: within.narrow(2, 0, na),
                    across: across.narrow(2, 0, na),
                },
            },
            messages,
        })
    }

    fn supports_imagine(&self) -> bool {
        self.cfg.imagine
    }

    fn produces_messages(&self) -> bool {
        self.msg.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::SyntheticBatch;
    use tch::{nn::VarStore, Device};

    fn cfg() -> AgentConfig {
        AgentConfig {
            entity_shape: 5,
            n_agents: 2,
            n_actions: 3,
            attn_embed_dim: 8,
            attn_n_heads: 2,
            rnn_hidden_dim: 6,
            ..Default::default()
        }
    }

    fn batch() -> EpisodeBatch {
        SyntheticBatch::entity(3, 4, 2, 3, 5, 5)
            .with_messages(4)
            .with_gt_mask()
            .build(Device::Cpu)
            .unwrap()
    }

    #[test]
    fn test_plain_forward_shapes() {
        let vs = VarStore::new(Device::Cpu);
        let agent = EntityAttentionAgent::new(vs.root() / "agent", &cfg()).unwrap();
        let out = agent.forward(&batch(), ForwardMode::plain()).unwrap();
        assert_eq!(out.q.full().size(), vec![3, 5, 2, 3]);
        assert!(out.messages.is_none());
        assert!(matches!(out.q, QValues::Plain(_)));
    }

    #[test]
    fn test_imagine_forward() {
        let vs = VarStore::new(Device::Cpu);
        let agent_cfg = AgentConfig {
            imagine: true,
            ..cfg()
        };
        let agent = EntityAttentionAgent::new(vs.root() / "agent", &agent_cfg).unwrap();
        let batch = batch();

        for gt in [false, true] {
            match agent.forward(&batch, ForwardMode::imagine(gt)).unwrap().q {
                QValues::Imagined {
                    full,
                    within_group,
                    across_group,
                    groups,
                } => {
                    assert_eq!(full.size(), vec![3, 5, 2, 3]);
                    assert_eq!(within_group.size(), full.size());
                    assert_eq!(across_group.size(), full.size());
                    assert_eq!(groups.within.size(), vec![3, 5, 2, 5]);
                    // an agent always shares a group with itself
                    assert_eq!(groups.within.double_value(&[0, 0, 0, 0]), 0.0);
                    assert_eq!(groups.across.double_value(&[0, 0, 0, 0]), 1.0);
                }
                QValues::Plain(_) => panic!("expected imagined Qs"),
            }
        }
    }

    #[test]
    fn test_imagine_requires_flag() {
        let vs = VarStore::new(Device::Cpu);
        let agent = EntityAttentionAgent::new(vs.root() / "agent", &cfg()).unwrap();
        assert!(agent.forward(&batch(), ForwardMode::imagine(false)).is_err());
    }

    #[test]
    fn test_messages_and_rank() {
        let vs = VarStore::new(Device::Cpu);
        let agent_cfg = AgentConfig {
            msg_dim: Some(4),
            repeat_attn: 1,
            rank_percent: Some(0.5),
            ..cfg()
        };
        let agent = EntityAttentionAgent::new(vs.root() / "agent", &agent_cfg).unwrap();
        let out = agent
            .forward(&batch(), ForwardMode::plain().with_messages())
            .unwrap();
        let messages = out.messages.unwrap();
        assert_eq!(messages.producing.mean().size(), vec![3, 5, 2, 4]);
        assert!(messages.inferring.variance().unwrap().min().double_value(&[]) > 0.0);
        assert_eq!(out.q.full().isnan().sum(Kind::Int64).int64_value(&[]), 0);
    }
}
