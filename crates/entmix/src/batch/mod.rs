//! Episode batches.
//!
//! An [`EpisodeBatch`] maps field names to dense tensors shaped
//! `[batch, time, ...]`. Masks follow the convention `1 = invalid`.

mod synthetic;

pub use synthetic::SyntheticBatch;

use crate::{EntmixError, Result};
use std::collections::HashMap;
use tch::{Device, Kind, Tensor};

/// Field names understood by the learners
pub mod fields {
    pub const STATE: &str = "state";
    pub const OBS: &str = "obs";
    pub const ENTITIES: &str = "entities";
    pub const ENTITY_MASK: &str = "entity_mask";
    pub const OBS_MASK: &str = "obs_mask";
    pub const ACTIONS: &str = "actions";
    pub const ACTIONS_ONEHOT: &str = "actions_onehot";
    pub const AVAIL_ACTIONS: &str = "avail_actions";
    pub const REWARD: &str = "reward";
    pub const TERMINATED: &str = "terminated";
    pub const FILLED: &str = "filled";
    pub const SELF_MESSAGE: &str = "self_message";
    pub const HEAD_MESSAGE: &str = "head_message";
    pub const HEAD_CHOICE: &str = "head_choice";
    pub const GT_MASK: &str = "gt_mask";
}

/// A batch of episode trajectories with shared `[batch, time]` extents
pub struct EpisodeBatch {
    data: HashMap<String, Tensor>,
    batch_size: i64,
    max_seq_length: i64,
    device: Device,
}

impl std::fmt::Debug for EpisodeBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.data.keys().collect();
        names.sort();
        f.debug_struct("EpisodeBatch")
            .field("batch_size", &self.batch_size)
            .field("max_seq_length", &self.max_seq_length)
            .field("device", &self.device)
            .field("fields", &names)
            .finish()
    }
}

impl EpisodeBatch {
    /// Build a batch, checking that every field shares the same leading extents
    pub fn new<S: Into<String>>(fields: impl IntoIterator<Item = (S, Tensor)>) -> Result<Self> {
        let data: HashMap<String, Tensor> =
            fields.into_iter().map(|(k, v)| (k.into(), v)).collect();

        let mut extents: Option<(String, i64, i64, Device)> = None;
        let mut names: Vec<&String> = data.keys().collect();
        names.sort();
        for name in names {
            let size = data[name].size();
            if size.len() < 2 {
                return Err(EntmixError::InvalidBatch(format!(
                    "field `{}` must be at least [batch, time], got {:?}",
                    name, size
                )));
            }
            match &extents {
                None => extents = Some((name.clone(), size[0], size[1], data[name].device())),
                Some((_, b, t, _)) if (size[0], size[1]) != (*b, *t) => {
                    return Err(EntmixError::ShapeMismatch {
                        field: name.clone(),
                        expected: vec![*b, *t],
                        actual: size[..2].to_vec(),
                    });
                }
                Some((_, _, _, device)) if data[name].device() != *device => {
                    return Err(EntmixError::InvalidBatch(format!(
                        "field `{}` lives on {:?}, expected {:?}",
                        name,
                        data[name].device(),
                        device
                    )));
                }
                Some(_) => {}
            }
        }

        let (_, batch_size, max_seq_length, device) = extents
            .ok_or_else(|| EntmixError::InvalidBatch("batch has no fields".into()))?;

        Ok(Self {
            data,
            batch_size,
            max_seq_length,
            device,
        })
    }

    /// Number of episodes
    pub fn batch_size(&self) -> i64 {
        self.batch_size
    }

    /// Number of timesteps (horizon + 1)
    pub fn max_seq_length(&self) -> i64 {
        self.max_seq_length
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn contains(&self, name: &str) -> bool {
        self.data.contains_key(name)
    }

    /// Field names, sorted
    pub fn field_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.data.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Borrow a field
    pub fn get(&self, name: &str) -> Result<&Tensor> {
        self.data
            .get(name)
            .ok_or_else(|| EntmixError::MissingField(name.to_string()))
    }

    /// A field converted to float (masks are often stored as uint8)
    pub fn get_float(&self, name: &str) -> Result<Tensor> {
        Ok(self.get(name)?.to_kind(Kind::Float))
    }

    /// Insert or replace a field
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Result<()> {
        let name = name.into();
        let size = tensor.size();
        if size.len() < 2 || size[0] != self.batch_size || size[1] != self.max_seq_length {
            return Err(EntmixError::ShapeMismatch {
                field: name,
                expected: vec![self.batch_size, self.max_seq_length],
                actual: size,
            });
        }
        self.data.insert(name, tensor.to_device(self.device));
        Ok(())
    }

    /// One-hot actions, taken from `actions_onehot` when present
    pub fn actions_onehot(&self, n_actions: i64) -> Result<Tensor> {
        if let Some(onehot) = self.data.get(fields::ACTIONS_ONEHOT) {
            return Ok(onehot.to_kind(Kind::Float));
        }
        let actions = self.get(fields::ACTIONS)?;
        Ok(actions
            .squeeze_dim(-1)
            .to_kind(Kind::Int64)
            .one_hot(n_actions)
            .to_kind(Kind::Float))
    }

    /// `entities` extended with the one-hot action each agent took at the
    /// previous step (zeros at step 0 and for non-agent entities).
    pub fn entities_with_last_action(&self, n_agents: i64, n_actions: i64) -> Result<Tensor> {
        let entities = self.get_float(fields::ENTITIES)?;
        let size = entities.size();
        let (b, t, ne) = (size[0], size[1], size[2]);
        let onehot = self.actions_onehot(n_actions)?;
        let last_actions = Tensor::zeros([b, t, ne, n_actions], (Kind::Float, self.device));
        if t > 1 {
            last_actions
                .narrow(1, 1, t - 1)
                .narrow(2, 0, n_agents)
                .copy_(&onehot.narrow(1, 0, t - 1));
        }
        Ok(Tensor::cat(&[entities, last_actions], 3))
    }

    /// Largest number of filled steps over the batch
    pub fn max_t_filled(&self) -> Result<i64> {
        let filled = self.get_float(fields::FILLED)?;
        let per_episode = filled.reshape([self.batch_size, self.max_seq_length, -1]).sum_dim_intlist(
            [1i64, 2].as_slice(),
            false,
            Kind::Float,
        );
        Ok(per_episode.max().double_value(&[]).round() as i64)
    }

    /// Keep only the first `t` timesteps
    pub fn truncate(&self, t: i64) -> Result<Self> {
        if t < 1 || t > self.max_seq_length {
            return Err(EntmixError::InvalidBatch(format!(
                "cannot truncate {} steps to {}",
                self.max_seq_length, t
            )));
        }
        Ok(Self {
            data: self
                .data
                .iter()
                .map(|(k, v)| (k.clone(), v.narrow(1, 0, t)))
                .collect(),
            batch_size: self.batch_size,
            max_seq_length: t,
            device: self.device,
        })
    }

    /// Select episodes by index (int64 tensor of batch indices)
    pub fn select_episodes(&self, index: &Tensor) -> Self {
        let index = index.to_device(self.device).to_kind(Kind::Int64);
        Self {
            data: self
                .data
                .iter()
                .map(|(k, v)| (k.clone(), v.index_select(0, &index)))
                .collect(),
            batch_size: index.size()[0],
            max_seq_length: self.max_seq_length,
            device: self.device,
        }
    }

    /// Concatenate batches with identical fields and horizon along the batch axis
    pub fn cat(batches: &[EpisodeBatch]) -> Result<Self> {
        let first = batches
            .first()
            .ok_or_else(|| EntmixError::InvalidBatch("nothing to concatenate".into()))?;
        let mut data = HashMap::with_capacity(first.data.len());
        for name in first.data.keys() {
            let parts = batches
                .iter()
                .map(|b| b.get(name).map(|t| t.to_device(first.device)))
                .collect::<Result<Vec<_>>>()?;
            data.insert(name.clone(), Tensor::cat(&parts, 0));
        }
        Self::new(data)
    }

    /// Move every field to `device` (no-op when already there)
    pub fn to_device(&mut self, device: Device) {
        if device == self.device {
            return;
        }
        for tensor in self.data.values_mut() {
            *tensor = tensor.to_device(device);
        }
        self.device = device;
    }

    /// Cheap copy sharing storage with `self`
    pub fn shallow_clone(&self) -> Self {
        Self {
            data: self
                .data
                .iter()
                .map(|(k, v)| (k.clone(), v.shallow_clone()))
                .collect(),
            batch_size: self.batch_size,
            max_seq_length: self.max_seq_length,
            device: self.device,
        }
    }
}
