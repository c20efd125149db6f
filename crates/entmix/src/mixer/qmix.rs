use super::{check_agent_qs, Mixer, MixerInput};
use crate::agent::ImagineGroups;
use crate::config::LearnerConfig;
use crate::{EntmixError, Result};
use tch::{nn, nn::Module, Tensor};

/// QMIX: state-conditioned hypernetworks with non-negative mixing weights
#[derive(Debug)]
pub struct QMixer {
    hyper_w_1: nn::Sequential,
    hyper_w_final: nn::Sequential,
    hyper_b_1: nn::Linear,
    v: nn::Sequential,
    n_agents: i64,
    embed_dim: i64,
    state_dim: i64,
}

fn two_layer(path: &nn::Path, in_dim: i64, hidden: i64, out_dim: i64) -> nn::Sequential {
    nn::seq()
        .add(nn::linear(path / "fc1", in_dim, hidden, Default::default()))
        .add_fn(|x| x.relu())
        .add(nn::linear(path / "fc2", hidden, out_dim, Default::default()))
}

impl QMixer {
    pub fn new(path: nn::Path, cfg: &LearnerConfig) -> Result<Self> {
        if cfg.state_shape < 1 {
            return Err(EntmixError::Config("qmix needs a positive state_shape".into()));
        }
        let (sd, ed, na) = (cfg.state_shape, cfg.mixing_embed_dim, cfg.n_agents);
        Ok(Self {
            hyper_w_1: two_layer(&(&path / "hyper_w_1"), sd, cfg.hypernet_embed, ed * na),
            hyper_w_final: two_layer(&(&path / "hyper_w_final"), sd, cfg.hypernet_embed, ed),
            hyper_b_1: nn::linear(&path / "hyper_b_1", sd, ed, Default::default()),
            v: two_layer(&(&path / "v"), sd, ed, 1),
            n_agents: na,
            embed_dim: ed,
            state_dim: sd,
        })
    }
}

impl Mixer for QMixer {
    fn mix(&self, agent_qs: &Tensor, inputs: &MixerInput) -> Result<Tensor> {
        let (bs, t) = check_agent_qs(agent_qs, self.n_agents)?;
        let states = inputs.state()?.reshape([-1, self.state_dim]);
        let qs = agent_qs.reshape([-1, 1, self.n_agents]);

        let w1 = self
            .hyper_w_1
            .forward(&states)
            .abs()
            .view([-1, self.n_agents, self.embed_dim]);
        let b1 = self.hyper_b_1.forward(&states).view([-1, 1, self.embed_dim]);
        let hidden = (qs.bmm(&w1) + b1).elu();

        let w_final = self
            .hyper_w_final
            .forward(&states)
            .abs()
            .view([-1, self.embed_dim, 1]);
        let v = self.v.forward(&states).view([-1, 1, 1]);

        Ok((hidden.bmm(&w_final) + v).view([bs, t, 1]))
    }

    fn mix_imagined(
        &self,
        _agent_qs: &Tensor,
        _inputs: &MixerInput,
        _groups: &ImagineGroups,
        _want_prop: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        Err(EntmixError::Config(
            "qmix cannot mix imagined groups".into(),
        ))
    }

    fn supports_imagine(&self) -> bool {
        false
    }
}
