//! Feed-forward agent for the state scheme.

use super::{AgentForward, AgentNetwork, ForwardMode, QValues};
use crate::batch::{fields, EpisodeBatch};
use crate::config::AgentConfig;
use crate::{EntmixError, Result};
use tch::{nn, nn::Module, Kind, Tensor};

/// Shared MLP over `[obs, last action, agent id]` per agent
#[derive(Debug)]
pub struct MlpAgent {
    net: nn::Sequential,
    n_agents: i64,
    n_actions: i64,
    obs_shape: i64,
    last_action: bool,
}

impl MlpAgent {
    pub fn new(path: nn::Path, cfg: &AgentConfig) -> Self {
        let last_action = if cfg.entity_last_action { cfg.n_actions } else { 0 };
        let in_dim = cfg.obs_shape + last_action + cfg.n_agents;
        let hidden = cfg.rnn_hidden_dim;

        let net = nn::seq()
            .add(nn::linear(&path / "fc1", in_dim, hidden, Default::default()))
            .add_fn(|x| x.relu())
            .add(nn::linear(&path / "fc2", hidden, hidden, Default::default()))
            .add_fn(|x| x.relu())
            .add(nn::linear(&path / "q", hidden, cfg.n_actions, Default::default()));

        Self {
            net,
            n_agents: cfg.n_agents,
            n_actions: cfg.n_actions,
            obs_shape: cfg.obs_shape,
            last_action: cfg.entity_last_action,
        }
    }

    fn inputs(&self, batch: &EpisodeBatch) -> Result<Tensor> {
        let obs = batch.get_float(fields::OBS)?;
        let size = obs.size();
        if size.len() != 4 || size[2] != self.n_agents || size[3] != self.obs_shape {
            return Err(EntmixError::ShapeMismatch {
                field: fields::OBS.into(),
                expected: vec![size[0], size[1], self.n_agents, self.obs_shape],
                actual: size,
            });
        }
        let (b, t) = (size[0], size[1]);
        let opts = (Kind::Float, batch.device());
        let mut parts = vec![obs];

        if self.last_action {
            let onehot = batch.actions_onehot(self.n_actions)?;
            let last = Tensor::zeros([b, t, self.n_agents, self.n_actions], opts);
            if t > 1 {
                last.narrow(1, 1, t - 1).copy_(&onehot.narrow(1, 0, t - 1));
            }
            parts.push(last);
        }
        parts.push(
            Tensor::eye(self.n_agents, opts)
                .reshape([1, 1, self.n_agents, self.n_agents])
                .expand([b, t, self.n_agents, self.n_agents], false),
        );
        Ok(Tensor::cat(&parts, 3))
    }
}

impl AgentNetwork for MlpAgent {
    fn forward(&self, batch: &EpisodeBatch, mode: ForwardMode) -> Result<AgentForward> {
        if mode.imagine || mode.messages {
            return Err(EntmixError::Config(
                "mlp agent supports neither imagine groups nor messages".into(),
            ));
        }
        Ok(AgentForward {
            q: QValues::Plain(self.net.forward(&self.inputs(batch)?)),
            messages: None,
        })
    }
}
