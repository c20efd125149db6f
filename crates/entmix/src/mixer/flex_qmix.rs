//! Mixers whose hypernetworks attend over the entity set.

use super::{check_agent_qs, Mixer, MixerInput};
use crate::agent::ImagineGroups;
use crate::config::LearnerConfig;
use crate::nn::{masked_mean, EntityAttentionLayer};
use crate::Result;
use tch::{nn, nn::Module, Kind, Tensor};

/// How an [`AttentionHyperNet`] reduces its per-agent embeddings
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HyperMode {
    /// `[N, na, embed]`
    Matrix,
    /// Mean over agents, `[N, embed]`
    Vector,
    /// Mean over the embedding, `[N, na]`
    AgentVector,
    /// Mean over both, `[N]`
    Scalar,
}

/// fc → relu → entity attention (agent queries) → fc
#[derive(Debug)]
pub struct AttentionHyperNet {
    fc1: nn::Linear,
    attn: EntityAttentionLayer,
    fc2: nn::Linear,
    mode: HyperMode,
    n_agents: i64,
}

impl AttentionHyperNet {
    pub fn new(path: nn::Path, cfg: &LearnerConfig, mode: HyperMode) -> Result<Self> {
        let embed = cfg.hypernet_embed;
        Ok(Self {
            fc1: nn::linear(&path / "fc1", cfg.mixer_entity_dim(), embed, Default::default()),
            attn: EntityAttentionLayer::new(&path / "attn", embed, embed, embed, cfg.attn_n_heads)?,
            fc2: nn::linear(&path / "fc2", embed, cfg.mixing_embed_dim, Default::default()),
            mode,
            n_agents: cfg.n_agents,
        })
    }

    /// `entities [N, ne, ed]`, `entity_mask [N, ne]`, optional
    /// `attn_mask [N, na, ne]` replacing the default presence mask.
    pub fn forward(&self, entities: &Tensor, entity_mask: &Tensor, attn_mask: Option<&Tensor>) -> Tensor {
        let x1 = self.fc1.forward(entities).relu();
        let agent_mask = entity_mask.narrow(1, 0, self.n_agents);
        let default_mask;
        let attn_mask = match attn_mask {
            Some(m) => m,
            None => {
                default_mask = 1.0f64
                    - (1.0f64 - &agent_mask).unsqueeze(2).bmm(&(1.0f64 - entity_mask).unsqueeze(1));
                &default_mask
            }
        };
        let x2 = self.attn.forward(&x1, Some(attn_mask), &agent_mask);
        let x3 = self
            .fc2
            .forward(&x2)
            .masked_fill(&agent_mask.gt(0.5).unsqueeze(2), 0.0);

        match self.mode {
            HyperMode::Matrix => x3,
            HyperMode::Vector => x3.mean_dim(Some(&[1i64][..]), false, Kind::Float),
            HyperMode::AgentVector => x3.mean_dim(Some(&[2i64][..]), false, Kind::Float),
            HyperMode::Scalar => x3.mean_dim(Some(&[1i64, 2][..]), false, Kind::Float),
        }
    }
}

fn flatten_entities(inputs: &MixerInput) -> Result<(Tensor, Tensor)> {
    let (entities, entity_mask) = inputs.entities()?;
    let size = entities.size();
    let (ne, ed) = (size[2], size[3]);
    Ok((
        entities.reshape([-1, ne, ed]),
        entity_mask.to_kind(Kind::Float).reshape([-1, ne]),
    ))
}

fn flatten_groups(groups: &ImagineGroups, ne: i64, n_agents: i64) -> (Tensor, Tensor) {
    (
        groups.within.reshape([-1, n_agents, ne]),
        groups.across.reshape([-1, n_agents, ne]),
    )
}

/// Share of weight mass in the within-group half, averaged over rows that
/// carry any mass. `w` is `[N, 2 * na]`.
fn ingroup_share(w: &Tensor, n_agents: i64) -> Tensor {
    let total = w.sum_dim_intlist([1i64].as_slice(), false, Kind::Float);
    let within = w
        .narrow(1, 0, n_agents)
        .sum_dim_intlist([1i64].as_slice(), false, Kind::Float);
    let live = total.gt(0.0).to_kind(Kind::Float);
    masked_mean(&(within / total.clamp_min(1e-8)), &live)
}

/// QMIX with attention hypernetworks over entities
#[derive(Debug)]
pub struct FlexQMixer {
    hyper_w_1: AttentionHyperNet,
    hyper_w_final: AttentionHyperNet,
    hyper_b_1: AttentionHyperNet,
    v: AttentionHyperNet,
    n_agents: i64,
    embed_dim: i64,
}

impl FlexQMixer {
    pub fn new(path: nn::Path, cfg: &LearnerConfig) -> Result<Self> {
        Ok(Self {
            hyper_w_1: AttentionHyperNet::new(&path / "hyper_w_1", cfg, HyperMode::Matrix)?,
            hyper_w_final: AttentionHyperNet::new(&path / "hyper_w_final", cfg, HyperMode::Vector)?,
            hyper_b_1: AttentionHyperNet::new(&path / "hyper_b_1", cfg, HyperMode::Vector)?,
            v: AttentionHyperNet::new(&path / "v", cfg, HyperMode::Scalar)?,
            n_agents: cfg.n_agents,
            embed_dim: cfg.mixing_embed_dim,
        })
    }

    fn combine(&self, qs: &Tensor, w1: &Tensor, entities: &Tensor, entity_mask: &Tensor) -> Tensor {
        let ed = self.embed_dim;
        let b1 = self.hyper_b_1.forward(entities, entity_mask, None).view([-1, 1, ed]);
        let hidden = (qs.bmm(w1) + b1).elu();
        let w_final = self
            .hyper_w_final
            .forward(entities, entity_mask, None)
            .abs()
            .view([-1, ed, 1]);
        let v = self.v.forward(entities, entity_mask, None).view([-1, 1, 1]);
        hidden.bmm(&w_final) + v
    }
}

impl Mixer for FlexQMixer {
    fn mix(&self, agent_qs: &Tensor, inputs: &MixerInput) -> Result<Tensor> {
        let (bs, t) = check_agent_qs(agent_qs, self.n_agents)?;
        let (entities, entity_mask) = flatten_entities(inputs)?;
        let qs = agent_qs.reshape([-1, 1, self.n_agents]);
        let w1 = self.hyper_w_1.forward(&entities, &entity_mask, None).abs();
        Ok(self.combine(&qs, &w1, &entities, &entity_mask).view([bs, t, 1]))
    }

    fn mix_imagined(
        &self,
        agent_qs: &Tensor,
        inputs: &MixerInput,
        groups: &ImagineGroups,
        want_prop: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let na = self.n_agents;
        let (bs, t) = check_agent_qs(agent_qs, 2 * na)?;
        let (entities, entity_mask) = flatten_entities(inputs)?;
        let (within, across) = flatten_groups(groups, entity_mask.size()[1], na);
        let qs = agent_qs.reshape([-1, 1, 2 * na]);

        let w1 = Tensor::cat(
            &[
                self.hyper_w_1.forward(&entities, &entity_mask, Some(&within)),
                self.hyper_w_1.forward(&entities, &entity_mask, Some(&across)),
            ],
            1,
        )
        .abs();
        let q_tot = self.combine(&qs, &w1, &entities, &entity_mask).view([bs, t, 1]);

        let prop = want_prop.then(|| {
            let per_agent = w1.mean_dim(Some(&[2i64][..]), false, Kind::Float);
            ingroup_share(&per_agent, na)
        });
        Ok((q_tot, prop))
    }
}

/// `q_tot = sum_i |w_i| q_i (+ V)` with attention hypernetwork weights
#[derive(Debug)]
pub struct LinearFlexQMixer {
    hyper_w_1: AttentionHyperNet,
    v: Option<AttentionHyperNet>,
    n_agents: i64,
}

impl LinearFlexQMixer {
    pub fn new(path: nn::Path, cfg: &LearnerConfig) -> Result<Self> {
        Self::build(path, cfg, true)
    }

    fn build(path: nn::Path, cfg: &LearnerConfig, with_v: bool) -> Result<Self> {
        let v = if with_v {
            Some(AttentionHyperNet::new(&path / "v", cfg, HyperMode::Scalar)?)
        } else {
            None
        };
        Ok(Self {
            hyper_w_1: AttentionHyperNet::new(&path / "hyper_w_1", cfg, HyperMode::AgentVector)?,
            v,
            n_agents: cfg.n_agents,
        })
    }

    fn combine(&self, qs: &Tensor, w: &Tensor, entities: &Tensor, entity_mask: &Tensor) -> Tensor {
        let weighted = (qs * w).sum_dim_intlist([1i64].as_slice(), true, Kind::Float);
        match &self.v {
            Some(v) => weighted + v.forward(entities, entity_mask, None).view([-1, 1]),
            None => weighted,
        }
    }
}

impl Mixer for LinearFlexQMixer {
    fn mix(&self, agent_qs: &Tensor, inputs: &MixerInput) -> Result<Tensor> {
        let (bs, t) = check_agent_qs(agent_qs, self.n_agents)?;
        let (entities, entity_mask) = flatten_entities(inputs)?;
        let w = self.hyper_w_1.forward(&entities, &entity_mask, None).abs();
        let qs = agent_qs.reshape([-1, self.n_agents]);
        Ok(self.combine(&qs, &w, &entities, &entity_mask).view([bs, t, 1]))
    }

    fn mix_imagined(
        &self,
        agent_qs: &Tensor,
        inputs: &MixerInput,
        groups: &ImagineGroups,
        want_prop: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let na = self.n_agents;
        let (bs, t) = check_agent_qs(agent_qs, 2 * na)?;
        let (entities, entity_mask) = flatten_entities(inputs)?;
        let (within, across) = flatten_groups(groups, entity_mask.size()[1], na);

        let w = Tensor::cat(
            &[
                self.hyper_w_1.forward(&entities, &entity_mask, Some(&within)),
                self.hyper_w_1.forward(&entities, &entity_mask, Some(&across)),
            ],
            1,
        )
        .abs();
        let qs = agent_qs.reshape([-1, 2 * na]);
        let q_tot = self.combine(&qs, &w, &entities, &entity_mask).view([bs, t, 1]);
        Ok((q_tot, want_prop.then(|| ingroup_share(&w, na))))
    }
}

/// Weighted VDN: [`LinearFlexQMixer`] without the state value term
#[derive(Debug)]
pub struct WvdnMixer(LinearFlexQMixer);

impl WvdnMixer {
    pub fn new(path: nn::Path, cfg: &LearnerConfig) -> Result<Self> {
        Ok(Self(LinearFlexQMixer::build(path, cfg, false)?))
    }
}

impl Mixer for WvdnMixer {
    fn mix(&self, agent_qs: &Tensor, inputs: &MixerInput) -> Result<Tensor> {
        self.0.mix(agent_qs, inputs)
    }

    fn mix_imagined(
        &self,
        agent_qs: &Tensor,
        inputs: &MixerInput,
        groups: &ImagineGroups,
        want_prop: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        self.0.mix_imagined(agent_qs, inputs, groups, want_prop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn::VarStore, Device};

    #[test]
    fn test_hypernet_modes() {
        let cfg = LearnerConfig {
            n_agents: 2,
            entity_shape: 3,
            n_actions: 2,
            hypernet_embed: 8,
            mixing_embed_dim: 6,
            attn_n_heads: 2,
            ..Default::default()
        };
        let vs = VarStore::new(Device::Cpu);
        let opts = (Kind::Float, Device::Cpu);
        let entities = Tensor::randn([5, 4, cfg.mixer_entity_dim()], opts);
        let entity_mask = Tensor::zeros([5, 4], opts);

        let expect = [
            (HyperMode::Matrix, vec![5, 2, 6]),
            (HyperMode::Vector, vec![5, 6]),
            (HyperMode::AgentVector, vec![5, 2]),
            (HyperMode::Scalar, vec![5]),
        ];
        for (i, (mode, shape)) in expect.into_iter().enumerate() {
            let net = AttentionHyperNet::new(vs.root() / format!("h{}", i), &cfg, mode).unwrap();
            assert_eq!(net.forward(&entities, &entity_mask, None).size(), shape);
        }
    }

    #[test]
    fn test_absent_agent_rows_are_zero() {
        let cfg = LearnerConfig {
            n_agents: 2,
            entity_shape: 3,
            n_actions: 2,
            hypernet_embed: 8,
            mixing_embed_dim: 6,
            attn_n_heads: 2,
            ..Default::default()
        };
        let vs = VarStore::new(Device::Cpu);
        let opts = (Kind::Float, Device::Cpu);
        let net = AttentionHyperNet::new(vs.root(), &cfg, HyperMode::Matrix).unwrap();
        let entities = Tensor::randn([1, 3, cfg.mixer_entity_dim()], opts);
        let entity_mask = Tensor::from_slice(&[0.0f32, 1.0, 0.0]).reshape([1, 3]);

        let out = net.forward(&entities, &entity_mask, None);
        assert_eq!(out.get(0).get(1).abs().sum(Kind::Float).double_value(&[]), 0.0);
    }

    #[test]
    fn test_ingroup_share() {
        let w = Tensor::from_slice(&[3.0f32, 1.0, 0.0, 0.0, 0.0, 0.0]).reshape([3, 2]);
        // rows without mass are ignored
        let share = ingroup_share(&w, 1).double_value(&[]);
        assert!((share - 0.75).abs() < 1e-6);
    }
}
