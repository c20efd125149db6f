//! Random but well-formed episode batches for tests and smoke runs.

use super::{fields, EpisodeBatch};
use crate::{EntmixError, Result};
use tch::{Device, Kind, Tensor};

#[derive(Clone, Debug)]
enum Scheme {
    Entity { n_entities: i64, entity_dim: i64 },
    State { state_dim: i64 },
}

/// Builder for synthetic [`EpisodeBatch`]es
#[derive(Clone, Debug)]
pub struct SyntheticBatch {
    batch_size: i64,
    steps: i64,
    n_agents: i64,
    n_actions: i64,
    scheme: Scheme,
    msg_dim: Option<i64>,
    terminate_at: Option<i64>,
    filled_steps: Option<Vec<i64>>,
    gt_mask: bool,
    absent_prob: f64,
}

impl SyntheticBatch {
    /// Entity-scheme batch with `steps` transitions (`steps + 1` timesteps)
    pub fn entity(
        batch_size: i64,
        steps: i64,
        n_agents: i64,
        n_actions: i64,
        n_entities: i64,
        entity_dim: i64,
    ) -> Self {
        Self::with_scheme(
            batch_size,
            steps,
            n_agents,
            n_actions,
            Scheme::Entity {
                n_entities,
                entity_dim,
            },
        )
    }

    /// State-scheme batch; per-agent observations share `state_dim`
    pub fn state(
        batch_size: i64,
        steps: i64,
        n_agents: i64,
        n_actions: i64,
        state_dim: i64,
    ) -> Self {
        Self::with_scheme(
            batch_size,
            steps,
            n_agents,
            n_actions,
            Scheme::State { state_dim },
        )
    }

    fn with_scheme(
        batch_size: i64,
        steps: i64,
        n_agents: i64,
        n_actions: i64,
        scheme: Scheme,
    ) -> Self {
        Self {
            batch_size,
            steps,
            n_agents,
            n_actions,
            scheme,
            msg_dim: None,
            terminate_at: None,
            filled_steps: None,
            gt_mask: false,
            absent_prob: 0.3,
        }
    }

    /// Add `self_message`, `head_message` and `head_choice`
    pub fn with_messages(mut self, msg_dim: i64) -> Self {
        self.msg_dim = Some(msg_dim);
        self
    }

    /// Terminate every episode at transition `t`; later steps become padding
    pub fn with_termination(mut self, t: i64) -> Self {
        self.terminate_at = Some(t);
        self
    }

    /// Number of filled timesteps per episode
    pub fn with_filled(mut self, filled: Vec<i64>) -> Self {
        self.filled_steps = Some(filled);
        self
    }

    /// Add a random ground-truth group split
    pub fn with_gt_mask(mut self) -> Self {
        self.gt_mask = true;
        self
    }

    /// Probability that a non-agent entity is absent at a step
    pub fn with_absent_prob(mut self, p: f64) -> Self {
        self.absent_prob = p;
        self
    }

    pub fn build(&self, device: Device) -> Result<EpisodeBatch> {
        let (b, na) = (self.batch_size, self.n_agents);
        let t = self.steps + 1;
        if b < 1 || self.steps < 1 || na < 1 || self.n_actions < 1 {
            return Err(EntmixError::Config(format!(
                "synthetic batch needs positive extents, got batch {} steps {} agents {} actions {}",
                b, self.steps, na, self.n_actions
            )));
        }
        let opts = (Kind::Float, device);
        let mut data: Vec<(&str, Tensor)> = Vec::new();

        let filled = self.filled_mask(b, t)?.to_device(device);
        let terminated = Tensor::zeros([b, t, 1], opts);
        if let Some(k) = self.terminate_at {
            if k < 0 || k >= self.steps {
                return Err(EntmixError::Config(format!(
                    "termination step {} outside [0, {})",
                    k, self.steps
                )));
            }
            let _ = terminated.narrow(1, k, 1).fill_(1.0);
        }
        data.push((fields::FILLED, filled));
        data.push((fields::TERMINATED, terminated));
        data.push((fields::REWARD, Tensor::randn([b, t, 1], opts)));

        let actions = Tensor::randint(self.n_actions, [b, t, na, 1], (Kind::Int64, device));
        let onehot = actions
            .squeeze_dim(-1)
            .one_hot(self.n_actions)
            .to_kind(Kind::Float);
        let avail = (Tensor::rand([b, t, na, self.n_actions], opts)
            .lt(0.5)
            .to_kind(Kind::Float)
            + &onehot)
            .clamp_max(1.0);
        data.push((fields::ACTIONS, actions));
        data.push((fields::ACTIONS_ONEHOT, onehot));
        data.push((fields::AVAIL_ACTIONS, avail));

        match self.scheme {
            Scheme::Entity {
                n_entities,
                entity_dim,
            } => {
                if n_entities < na {
                    return Err(EntmixError::Config(format!(
                        "{} entities cannot hold {} agents",
                        n_entities, na
                    )));
                }
                let ne = n_entities;
                let absent = Tensor::rand([b, t, ne], opts)
                    .lt(self.absent_prob)
                    .to_kind(Kind::Float);
                // agents are always present
                let _ = absent.narrow(2, 0, na).fill_(0.0);
                let valid = 1.0f64 - &absent;
                let pair_valid = valid.unsqueeze(3) * valid.unsqueeze(2);
                let hidden = Tensor::rand([b, t, ne, ne], opts).lt(0.2).to_kind(Kind::Float)
                    * (1.0f64 - Tensor::eye(ne, opts));
                let obs_mask = ((1.0f64 - pair_valid) + hidden).clamp_max(1.0);

                data.push((
                    fields::ENTITIES,
                    Tensor::randn([b, t, ne, entity_dim], opts),
                ));
                data.push((fields::ENTITY_MASK, absent));
                data.push((fields::OBS_MASK, obs_mask));

                if self.gt_mask {
                    let own = Tensor::eye(ne, opts).narrow(0, 0, na);
                    let gt = Tensor::rand([b, t, na, ne], opts).lt(0.5).to_kind(Kind::Float)
                        * (1.0 - own);
                    data.push((fields::GT_MASK, gt));
                }
            }
            Scheme::State { state_dim } => {
                data.push((fields::STATE, Tensor::randn([b, t, state_dim], opts)));
                data.push((fields::OBS, Tensor::randn([b, t, na, state_dim], opts)));
            }
        }

        if let Some(msg_dim) = self.msg_dim {
            data.push((
                fields::SELF_MESSAGE,
                Tensor::randn([b, t, na, msg_dim], opts),
            ));
            data.push((
                fields::HEAD_MESSAGE,
                Tensor::randn([b, t, na, msg_dim], opts),
            ));
            data.push((
                fields::HEAD_CHOICE,
                Tensor::randint(na, [b, t, 1], (Kind::Int64, device)),
            ));
        }

        EpisodeBatch::new(data)
    }

    fn filled_mask(&self, b: i64, t: i64) -> Result<Tensor> {
        let mut lengths = match &self.filled_steps {
            Some(lengths) if lengths.len() as i64 != b => {
                return Err(EntmixError::Config(format!(
                    "{} filled lengths for {} episodes",
                    lengths.len(),
                    b
                )));
            }
            Some(lengths) => lengths.iter().map(|&l| l.clamp(1, t)).collect(),
            None => vec![t; b as usize],
        };
        if let Some(k) = self.terminate_at {
            for len in lengths.iter_mut() {
                *len = (*len).min(k + 2);
            }
        }

        let mut values = Vec::with_capacity((b * t) as usize);
        for len in lengths {
            values.extend((0..t).map(|step| if step < len { 1.0f32 } else { 0.0 }));
        }
        Ok(Tensor::from_slice(&values).reshape([b, t, 1]))
    }
}
