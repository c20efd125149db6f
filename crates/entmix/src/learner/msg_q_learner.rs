use super::td::TdCore;
use super::{load_prefixed, named_variables, save_prefixed, Learner, RmsProp};
use crate::agent::{AgentNetwork, Elector, MessageDistributions};
use crate::batch::{fields, EpisodeBatch};
use crate::config::LearnerConfig;
use crate::log::MetricLogger;
use crate::nn::Distribution;
use crate::{EntmixError, Result};
use std::path::Path;
use std::sync::Arc;
use tch::{nn, Kind, Tensor};
use tracing::debug;

const ELECTOR_PREFIX: &str = "elector.";

/// Q-learning with learned messages.
///
/// Each agent produces a message distribution at `t` and infers one at
/// `t + msg_T` from its hidden state and the broadcast head message. The
/// Q loss is regularised towards agreement between the two (entropy, KL and
/// an optional contrastive bound). An optional [`Elector`] choosing the
/// broadcasting agent is trained by REINFORCE on chunked returns; it has its
/// own store and optimizer and is never part of the target path.
pub struct MsgQLearner<A> {
    core: TdCore<A>,
    elector: Option<ElectorTrainer>,
}

struct ElectorTrainer {
    vs: nn::VarStore,
    elector: Box<dyn Elector>,
    optimizer: RmsProp,
    log_stats_t: Option<u64>,
}

impl<A: AgentNetwork> MsgQLearner<A> {
    pub fn new<F>(agent_factory: F, cfg: LearnerConfig, logger: Arc<dyn MetricLogger>) -> Result<Self>
    where
        F: Fn(nn::Path) -> Result<A>,
    {
        let core = TdCore::new(agent_factory, cfg, logger)?;
        if !core.cfg.no_summary && !core.agent().produces_messages() {
            return Err(EntmixError::Config(
                "messaging losses need an agent with a message encoder (set msg_dim or no_summary)"
                    .into(),
            ));
        }
        Ok(Self {
            core,
            elector: None,
        })
    }

    /// Attach an elector built under its own parameter store
    pub fn with_elector<E, F>(mut self, elector_factory: F) -> Result<Self>
    where
        E: Elector + 'static,
        F: FnOnce(nn::Path) -> Result<E>,
    {
        let vs = nn::VarStore::new(self.core.cfg.device);
        let elector = elector_factory(vs.root() / "elector")?;
        let optimizer = RmsProp::from_config(named_variables(&vs, ""), &self.core.cfg);
        self.elector = Some(ElectorTrainer {
            vs,
            elector: Box::new(elector),
            optimizer,
            log_stats_t: None,
        });
        Ok(self)
    }

    pub fn config(&self) -> &LearnerConfig {
        &self.core.cfg
    }

    pub fn agent(&self) -> &A {
        self.core.agent()
    }

    /// The elector, for choosing senders while acting
    pub fn elector(&self) -> Option<&dyn Elector> {
        self.elector.as_ref().map(|e| e.elector.as_ref())
    }

    pub fn elector_var_store(&self) -> Option<&nn::VarStore> {
        self.elector.as_ref().map(|e| &e.vs)
    }

    pub fn var_store(&self) -> &nn::VarStore {
        self.core.var_store()
    }

    pub fn target_var_store(&self) -> &nn::VarStore {
        self.core.target_var_store()
    }

    /// Entropy, KL and contrastive terms for one batch, added to `loss`
    fn message_loss(
        &self,
        messages: &MessageDistributions,
        t: i64,
        loss: Tensor,
        stats: &mut Vec<(&'static str, f64)>,
        will_log: bool,
    ) -> Result<Tensor> {
        let cfg = &self.core.cfg;
        let window = t - cfg.msg_t;
        let producing = messages.producing.map(|x| x.narrow(1, 0, window));
        let inferring = messages.inferring.map(|x| x.narrow(1, cfg.msg_t, window));

        let entropy_loss = -sum_last(&producing.entropy()).mean(Kind::Float) * cfg.msg_entropy_weight;
        let kl = producing.kl(&inferring).ok_or_else(|| {
            EntmixError::Config("producing and inferring messages differ in family".into())
        })?;
        let kl_loss = sum_last(&kl).mean(Kind::Float) * cfg.msg_ce_weight;
        let mut loss = loss + &entropy_loss + &kl_loss;

        if will_log {
            let (p_mean, p_std) = gaussian_parts(&producing)?;
            let (i_mean, i_std) = gaussian_parts(&inferring)?;
            let mean_of = |x: &Tensor| x.mean(Kind::Float).double_value(&[]);
            stats.push(("kl_loss", kl_loss.double_value(&[])));
            stats.push(("msg_dis_mean", mean_of(p_mean)));
            stats.push(("msg_dis_inf_mean", mean_of(i_mean)));
            stats.push(("msg_dis_var", mean_of(p_std)));
            stats.push(("msg_dis_inf_var", mean_of(i_std)));
            stats.push(("entropy_loss", entropy_loss.double_value(&[])));
        }

        if cfg.ceb_weight > 0.0 {
            let (contrastive, sampled_kl) = ceb_terms(&producing, &inferring, cfg.ceb_kl_weight > 0.0)?;
            let ceb_loss = contrastive * cfg.ceb_weight;
            loss = loss + &ceb_loss;
            if will_log {
                stats.push(("ceb_loss", ceb_loss.double_value(&[])));
            }
            if let Some(sampled_kl) = sampled_kl {
                let ceb_kl_loss = sampled_kl * cfg.ceb_kl_weight;
                loss = loss + &ceb_kl_loss;
                if will_log {
                    stats.push(("ceb_kl_loss", ceb_kl_loss.double_value(&[])));
                }
            }
        }
        Ok(loss)
    }
}

impl<A: AgentNetwork> Learner for MsgQLearner<A> {
    fn train(&mut self, batch: &EpisodeBatch, t_env: u64, episode_num: u64) -> Result<()> {
        let will_log = self.core.will_log(t_env);
        let pass = self.core.td_pass(batch, !self.core.cfg.no_summary, will_log)?;
        let mut stats = pass.stats;
        if will_log {
            stats.push(("q_loss", pass.loss.double_value(&[])));
        }

        let t = batch.max_seq_length();
        let loss = match &pass.messages {
            Some(messages) if t > self.core.cfg.msg_t => {
                self.message_loss(messages, t, pass.loss.shallow_clone(), &mut stats, will_log)?
            }
            Some(_) => {
                debug!(
                    "{} timesteps leave no window for msg_T = {}; skipping message losses",
                    t, self.core.cfg.msg_t
                );
                pass.loss.shallow_clone()
            }
            None => pass.loss.shallow_clone(),
        };

        self.core.apply(&loss, stats, t_env, episode_num, will_log)?;
        Ok(())
    }

    fn train_elector(&mut self, batch: &EpisodeBatch, t_env: u64, _episode_num: u64) -> Result<()> {
        let Some(trainer) = self.elector.as_mut() else {
            return Ok(());
        };
        let cfg = &self.core.cfg;
        let t = batch.max_seq_length();
        if t < 2 {
            return Err(EntmixError::InvalidBatch(format!(
                "need at least 2 timesteps, got {}",
                t
            )));
        }
        let steps = t - 1;
        let rewards = batch.get_float(fields::REWARD)?.narrow(1, 0, steps);
        let terminated = batch.get_float(fields::TERMINATED)?.narrow(1, 0, steps);
        let choice = batch
            .get(fields::HEAD_CHOICE)?
            .narrow(1, 0, steps)
            .to_kind(Kind::Int64);
        let log_pi = trainer
            .elector
            .log_probs(batch)?
            .narrow(1, 0, steps)
            .gather(2, &choice, false);

        let loss = elector_loss(&rewards, &terminated, &log_pi, cfg.msg_t, cfg.gamma);
        trainer.optimizer.zero_grad();
        loss.backward();
        trainer.optimizer.step();

        let due = match trainer.log_stats_t {
            None => true,
            Some(last) => t_env.saturating_sub(last) >= cfg.learner_log_interval,
        };
        if due {
            self.core
                .logger
                .log_stat("elector_loss", loss.double_value(&[]), t_env);
            trainer.log_stats_t = Some(t_env);
        }
        Ok(())
    }

    fn save_models(&self, dir: &Path) -> Result<()> {
        self.core.save(dir)?;
        if let Some(trainer) = &self.elector {
            save_prefixed(&trainer.vs, ELECTOR_PREFIX, &dir.join("elector.th"))?;
            trainer.optimizer.save(dir.join("elector_opt.th"))?;
        }
        Ok(())
    }

    /// Elector parameters are always restored since acting reads them; its
    /// optimizer only outside `evaluate`.
    fn load_models(&mut self, dir: &Path, evaluate: bool) -> Result<()> {
        self.core.load(dir, evaluate)?;
        if let Some(trainer) = self.elector.as_mut() {
            load_prefixed(&[&trainer.vs], ELECTOR_PREFIX, &dir.join("elector.th"))?;
            if !evaluate {
                trainer.optimizer.load(dir.join("elector_opt.th"))?;
            }
        }
        Ok(())
    }
}

fn sum_last(x: &Tensor) -> Tensor {
    x.sum_dim_intlist([-1i64].as_slice(), false, Kind::Float)
}

fn gaussian_parts(dist: &Distribution) -> Result<(&Tensor, &Tensor)> {
    match dist {
        Distribution::Gaussian { mean, std } => Ok((mean, std)),
        Distribution::Categorical { .. } => Err(EntmixError::Config(
            "message distributions must be Gaussian".into(),
        )),
    }
}

/// Contrastive bound between producing and inferring messages `[B, t, na, d]`.
///
/// One `z` is sampled (without gradient) from every producing distribution.
/// At each step the `N = B * na` samples are scored under every inferring
/// distribution, and the loss is the mean negative log softmax of each
/// sample under its own. With `with_kl` the sampled
/// `(log p(z) - log q(z)).sum(-1).mean()` is returned too.
pub fn ceb_terms(
    producing: &Distribution,
    inferring: &Distribution,
    with_kl: bool,
) -> Result<(Tensor, Option<Tensor>)> {
    let (mean, _) = gaussian_parts(producing)?;
    gaussian_parts(inferring)?;
    let size = mean.size();
    if size.len() != 4 {
        return Err(EntmixError::ShapeMismatch {
            field: "message".into(),
            expected: vec![-1, -1, -1, -1],
            actual: size,
        });
    }
    let (b, t, na, d) = (size[0], size[1], size[2], size[3]);
    let n = b * na;

    // softmax runs over agents of one step only, never over time
    let time_major = |x: &Tensor| x.permute([1, 0, 2, 3]).reshape([t, 1, n, d]);
    let da = producing.map(&time_major);
    let db = inferring.map(&time_major);

    let z = da.sample().detach();
    let kl = if with_kl {
        Some(sum_last(&(da.log_prob(&z) - db.log_prob(&z))).mean(Kind::Float))
    } else {
        None
    };

    // logits[s, i, j] = log q_j(z_i)
    let logits = sum_last(&db.log_prob(&z.reshape([t, n, 1, d])));
    let matched = logits.log_softmax(-1, Kind::Float).diagonal(0, 1, 2);
    Ok((-matched.mean(Kind::Float), kl))
}

/// REINFORCE loss of the elector over `msg_t`-step chunks.
///
/// `rewards` and `terminated` are `[B, t, 1]`; `log_pi` holds the
/// log-probability of the chosen sender at every step `[B, t, 1]`, of which
/// only chunk-start steps are used. Chunks starting at or after termination
/// earn nothing and do not count towards the per-episode normaliser.
pub fn elector_loss(
    rewards: &Tensor,
    terminated: &Tensor,
    log_pi: &Tensor,
    msg_t: i64,
    gamma: f64,
) -> Tensor {
    let size = rewards.size();
    let (b, t) = (size[0], size[1]);
    let opts = (Kind::Float, rewards.device());
    let n_chunks = (t + msg_t - 1) / msg_t;
    let pad = n_chunks * msg_t - t;

    let padded = if pad > 0 {
        Tensor::cat(&[rewards.shallow_clone(), Tensor::zeros([b, pad, 1], opts)], 1)
    } else {
        rewards.shallow_clone()
    };
    let chunk_rewards = padded
        .reshape([b, n_chunks, msg_t, 1])
        .sum_dim_intlist([2i64].as_slice(), false, Kind::Float);

    let starts = Tensor::arange_start_step(0, t, msg_t, (Kind::Int64, rewards.device()));
    let done = terminated
        .cumsum(1, Kind::Float)
        .clamp_max(1.0)
        .index_select(1, &starts);
    let chunk_rewards = chunk_rewards * (1.0f64 - &done);
    let log_pi = log_pi.index_select(1, &starts).clamp_min(1e-10f64.ln());

    let mut ret = Tensor::zeros([b, 1], opts);
    let mut loss = Tensor::zeros([b, 1], opts);
    for c in (0..n_chunks).rev() {
        ret = chunk_rewards.select(1, c) + ret * gamma;
        loss = loss - log_pi.select(1, c) * &ret;
    }
    let live_chunks = (1.0f64 - done)
        .sum_dim_intlist([1i64].as_slice(), false, Kind::Float)
        .clamp_min(1.0);
    (loss / live_chunks).mean(Kind::Float)
}
