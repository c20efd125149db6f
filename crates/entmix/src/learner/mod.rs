//! Value-decomposition learners.
//!
//! Provides:
//! - `QLearner`: double-Q TD learning through a monotonic mixer, with the
//!   imagined within/across group loss and the local consistency constraint
//! - `MsgQLearner`: the same update plus an information bottleneck on agent
//!   messages and a REINFORCE-trained elector
//! - `RmsProp`, the optimizer both learners step

mod msg_q_learner;
mod optim;
mod q_learner;
mod td;

pub use msg_q_learner::{ceb_terms, elector_loss, MsgQLearner};
pub use optim::RmsProp;
pub use q_learner::QLearner;

use crate::batch::EpisodeBatch;
use crate::{EntmixError, Result};
use std::collections::HashMap;
use std::path::Path;
use tch::{nn, Tensor};

/// Common surface of the learners driven by the training loop
pub trait Learner {
    /// One gradient step on `batch`.
    ///
    /// `t_env` drives the logging cadence, `episode_num` the target cadence.
    fn train(&mut self, batch: &EpisodeBatch, t_env: u64, episode_num: u64) -> Result<()>;

    /// Update any auxiliary policy trained from the same batch, on the same
    /// clocks as [`train`](Self::train)
    fn train_elector(&mut self, _batch: &EpisodeBatch, _t_env: u64, _episode_num: u64) -> Result<()> {
        Ok(())
    }

    fn save_models(&self, dir: &Path) -> Result<()>;

    /// Restore a model directory. With `evaluate`, only agent parameters are
    /// loaded.
    fn load_models(&mut self, dir: &Path, evaluate: bool) -> Result<()>;
}

/// Variables of `vs` whose name starts with `prefix`, sorted by name
pub(crate) fn named_variables(vs: &nn::VarStore, prefix: &str) -> Vec<(String, Tensor)> {
    let mut vars: Vec<(String, Tensor)> = vs
        .variables()
        .into_iter()
        .filter(|(name, _)| name.starts_with(prefix))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    vars
}

/// Write the variables under `prefix`. Nothing is written when there are none.
pub(crate) fn save_prefixed(vs: &nn::VarStore, prefix: &str, path: &Path) -> Result<()> {
    let vars = named_variables(vs, prefix);
    if vars.is_empty() {
        return Ok(());
    }
    let named: Vec<(&str, &Tensor)> = vars.iter().map(|(n, t)| (n.as_str(), t)).collect();
    Tensor::save_multi(&named, path)?;
    Ok(())
}

/// Copy saved values into every store's variables under `prefix`
pub(crate) fn load_prefixed(stores: &[&nn::VarStore], prefix: &str, path: &Path) -> Result<()> {
    let Some(first) = stores.first() else {
        return Ok(());
    };
    if named_variables(first, prefix).is_empty() {
        return Ok(());
    }
    let saved: HashMap<String, Tensor> = Tensor::load_multi(path)?.into_iter().collect();

    for vs in stores {
        for (name, mut var) in named_variables(vs, prefix) {
            let value = saved.get(&name).ok_or_else(|| {
                EntmixError::Checkpoint(format!("{} is missing `{}`", path.display(), name))
            })?;
            if value.size() != var.size() {
                return Err(EntmixError::ShapeMismatch {
                    field: name,
                    expected: var.size(),
                    actual: value.size(),
                });
            }
            tch::no_grad(|| var.copy_(&value.to_device(var.device())));
        }
    }
    Ok(())
}
