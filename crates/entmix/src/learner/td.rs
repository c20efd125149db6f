//! TD update shared by both learners.

use super::{load_prefixed, named_variables, save_prefixed, RmsProp};
use crate::agent::{AgentNetwork, ForwardMode, ImagineGroups, MessageDistributions, QValues};
use crate::batch::{fields, EpisodeBatch};
use crate::config::LearnerConfig;
use crate::log::MetricLogger;
use crate::mixer::{build_mixer, Mixer, MixerInput};
use crate::{EntmixError, Result};
use std::path::Path;
use std::sync::Arc;
use tch::{nn, Kind, Tensor};
use tracing::info;

const AGENT_PREFIX: &str = "agent.";
const MIXER_PREFIX: &str = "mixer.";
const UNAVAILABLE_Q: f64 = -9_999_999.0;

/// Loss of one forward pass and the statistics gathered on the way
pub(crate) struct TdPass {
    pub loss: Tensor,
    pub stats: Vec<(&'static str, f64)>,
    pub messages: Option<MessageDistributions>,
}

/// Live and target networks, their optimizer and the update cadences
pub(crate) struct TdCore<A> {
    pub cfg: LearnerConfig,
    pub logger: Arc<dyn MetricLogger>,
    vs: nn::VarStore,
    target_vs: nn::VarStore,
    agent: A,
    target_agent: A,
    mixer: Box<dyn Mixer>,
    target_mixer: Box<dyn Mixer>,
    optimizer: RmsProp,
    last_target_update_episode: u64,
    log_stats_t: Option<u64>,
}

impl<A: AgentNetwork> TdCore<A> {
    pub fn new<F>(agent_factory: F, cfg: LearnerConfig, logger: Arc<dyn MetricLogger>) -> Result<Self>
    where
        F: Fn(nn::Path) -> Result<A>,
    {
        cfg.validate()?;
        let vs = nn::VarStore::new(cfg.device);
        let mut target_vs = nn::VarStore::new(cfg.device);

        let agent = agent_factory(vs.root() / "agent")?;
        let target_agent = agent_factory(target_vs.root() / "agent")?;
        let mixer = build_mixer(&cfg, vs.root() / "mixer")?;
        let target_mixer = build_mixer(&cfg, target_vs.root() / "mixer")?;

        if agent.supports_imagine() && !mixer.supports_imagine() {
            return Err(EntmixError::Config(format!(
                "{} cannot mix imagined groups",
                cfg.mixer
            )));
        }

        target_vs.copy(&vs)?;
        target_vs.freeze();

        let optimizer = RmsProp::from_config(named_variables(&vs, ""), &cfg);

        Ok(Self {
            cfg,
            logger,
            vs,
            target_vs,
            agent,
            target_agent,
            mixer,
            target_mixer,
            optimizer,
            last_target_update_episode: 0,
            log_stats_t: None,
        })
    }

    pub fn agent(&self) -> &A {
        &self.agent
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    pub fn target_var_store(&self) -> &nn::VarStore {
        &self.target_vs
    }

    /// Whether metrics are due at `t_env`; the first call always logs
    pub fn will_log(&self, t_env: u64) -> bool {
        match self.log_stats_t {
            None => true,
            Some(last) => t_env.saturating_sub(last) >= self.cfg.learner_log_interval,
        }
    }

    /// Forward both networks and build the TD loss (imagined and local terms
    /// included). Statistics are only gathered when `will_log`.
    pub fn td_pass(&self, batch: &EpisodeBatch, messages: bool, will_log: bool) -> Result<TdPass> {
        let t = batch.max_seq_length();
        if t < 2 {
            return Err(EntmixError::InvalidBatch(format!(
                "need at least 2 timesteps, got {}",
                t
            )));
        }
        let steps = t - 1;
        let rewards = batch.get_float(fields::REWARD)?.narrow(1, 0, steps);
        let actions = batch
            .get(fields::ACTIONS)?
            .narrow(1, 0, steps)
            .to_kind(Kind::Int64);
        let terminated = batch.get_float(fields::TERMINATED)?.narrow(1, 0, steps);
        let filled = batch.get_float(fields::FILLED)?.narrow(1, 0, steps);
        let mask = transition_mask(&filled, &terminated);

        let mut mode = if self.agent.supports_imagine() {
            ForwardMode::imagine(self.cfg.train_gt_factors)
        } else {
            ForwardMode::plain()
        };
        if messages {
            mode = mode.with_messages();
        }
        let out = self.agent.forward(batch, mode)?;
        let mac_out = out.q.full();
        let chosen = mac_out
            .narrow(1, 0, steps)
            .gather(3, &actions, false)
            .squeeze_dim(3);

        let unavailable = batch.get(fields::AVAIL_ACTIONS)?.narrow(1, 1, steps).eq(0);
        let target_out = tch::no_grad(|| self.target_agent.forward(batch, ForwardMode::plain()))?;
        let target_max = bootstrap_qs(
            &mac_out.detach().narrow(1, 1, steps),
            &target_out.q.full().narrow(1, 1, steps),
            &unavailable,
            self.cfg.double_q,
        );

        let (inputs, next_inputs) = MixerInput::from_batch(batch, &self.cfg)?;
        let q_tot = self.mixer.mix(&chosen, &inputs)?;
        let target_tot = tch::no_grad(|| self.target_mixer.mix(&target_max, &next_inputs))?;
        let targets = td_targets(&rewards, &terminated, &target_tot, self.cfg.gamma);

        let (mut loss, masked_td_error) = masked_td_loss(&q_tot, &targets, &mask);
        let mut stats = Vec::new();

        if let Some((im_chosen, groups)) = imagined_chosen(&out.q, &actions, steps) {
            let want_prop = will_log && self.cfg.test_gt_factors;
            let (im_tot, prop) = self.mixer.mix_imagined(&im_chosen, &inputs, &groups, want_prop)?;
            let (im_loss, _) = masked_td_loss(&im_tot, &targets, &mask);
            loss = loss * (1.0 - self.cfg.lmbda) + &im_loss * self.cfg.lmbda;

            if will_log {
                stats.push(("im_loss", im_loss.double_value(&[])));
                if let Some(prop) = prop {
                    stats.push(("ingroup_prop", prop.double_value(&[])));
                    let gt_prop =
                        tch::no_grad(|| self.gt_ingroup_prop(batch, &actions, &inputs, steps))?;
                    stats.push(("gt_ingroup_prop", gt_prop));
                }
            }
        }

        if self.cfg.local_constraint {
            let q_ref = if self.cfg.ave_tot {
                self.deviation_q_tot(mac_out, &chosen, &inputs, steps)?
            } else {
                q_tot.shallow_clone()
            };
            let local_loss = local_constraint_loss(
                &q_ref,
                &chosen,
                &mask,
                self.cfg.q_tol,
                self.cfg.local_constraint_weight,
            );
            loss = loss + &local_loss;

            if will_log {
                stats.push(("local_loss", local_loss.double_value(&[])));
                stats.push((
                    "min_local_taken_q",
                    chosen.min_dim(2, false).0.mean(Kind::Float).double_value(&[]),
                ));
                stats.push((
                    "max_local_taken_q",
                    chosen.max_dim(2, false).0.mean(Kind::Float).double_value(&[]),
                ));
            }
        }

        if will_log {
            let mask_elems = mask.sum(Kind::Float).double_value(&[]);
            let per_agent = mask_elems * self.cfg.n_agents as f64;
            stats.push((
                "td_error_abs",
                masked_td_error.abs().sum(Kind::Float).double_value(&[]) / mask_elems,
            ));
            stats.push((
                "q_taken_mean",
                (&q_tot * &mask).sum(Kind::Float).double_value(&[]) / per_agent,
            ));
            stats.push((
                "target_mean",
                (&targets * &mask).sum(Kind::Float).double_value(&[]) / per_agent,
            ));
            if t == 2 && !self.cfg.entity_scheme {
                stats.push(("max_qtot", self.max_q_tot(batch, mac_out)?));
            }
        }

        Ok(TdPass {
            loss,
            stats,
            messages: out.messages,
        })
    }

    /// Backprop `loss`, step the optimizer, sync targets on schedule and
    /// emit `loss`, `grad_norm` and `stats` when `will_log`.
    pub fn apply(
        &mut self,
        loss: &Tensor,
        stats: Vec<(&'static str, f64)>,
        t_env: u64,
        episode_num: u64,
        will_log: bool,
    ) -> Result<f64> {
        self.optimizer.zero_grad();
        loss.backward();
        let grad_norm = self.optimizer.clip_grad_norm(self.cfg.grad_norm_clip);
        self.optimizer.step();

        if episode_num.saturating_sub(self.last_target_update_episode)
            >= self.cfg.target_update_interval
        {
            self.update_targets()?;
            self.last_target_update_episode = episode_num;
        }

        if will_log {
            self.logger.log_stat("loss", loss.double_value(&[]), t_env);
            self.logger.log_stat("grad_norm", grad_norm, t_env);
            for (name, value) in stats {
                self.logger.log_stat(name, value, t_env);
            }
            self.log_stats_t = Some(t_env);
        }
        Ok(grad_norm)
    }

    /// Hard copy of live agent and mixer parameters into the target networks
    pub fn update_targets(&mut self) -> Result<()> {
        self.target_vs.copy(&self.vs)?;
        info!("Updated target network");
        Ok(())
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        save_prefixed(&self.vs, AGENT_PREFIX, &dir.join("agent.th"))?;
        save_prefixed(&self.vs, MIXER_PREFIX, &dir.join("mixer.th"))?;
        self.optimizer.save(dir.join("opt.th"))
    }

    /// The agent goes into live and target; mixer and optimizer state into
    /// the live side only, and not at all under `evaluate`.
    pub fn load(&mut self, dir: &Path, evaluate: bool) -> Result<()> {
        load_prefixed(
            &[&self.vs, &self.target_vs],
            AGENT_PREFIX,
            &dir.join("agent.th"),
        )?;
        if !evaluate {
            load_prefixed(&[&self.vs], MIXER_PREFIX, &dir.join("mixer.th"))?;
            self.optimizer.load(dir.join("opt.th"))?;
        }
        Ok(())
    }

    fn gt_ingroup_prop(
        &self,
        batch: &EpisodeBatch,
        actions: &Tensor,
        inputs: &MixerInput,
        steps: i64,
    ) -> Result<f64> {
        let out = self.agent.forward(batch, ForwardMode::imagine(true))?;
        let (im_chosen, groups) = imagined_chosen(&out.q, actions, steps).ok_or_else(|| {
            EntmixError::Config("agent returned plain Qs for an imagine forward".into())
        })?;
        let (_, prop) = self.mixer.mix_imagined(&im_chosen, inputs, &groups, true)?;
        prop.map(|p| p.double_value(&[])).ok_or_else(|| {
            EntmixError::Config(format!("{} reports no in-group proportion", self.cfg.mixer))
        })
    }

    /// Joint value averaged over every single-agent action deviation from
    /// the taken joint action `[B, t, 1]`.
    fn deviation_q_tot(
        &self,
        mac_out: &Tensor,
        chosen: &Tensor,
        inputs: &MixerInput,
        steps: i64,
    ) -> Result<Tensor> {
        let (na, n_actions) = (self.cfg.n_agents, self.cfg.n_actions);
        let k = na * n_actions;
        let qs = mac_out.narrow(1, 0, steps);
        let b = qs.size()[0];
        let opts = (Kind::Float, qs.device());

        // column i * n_actions + a swaps agent i's Q for Q_i(a)
        let own = Tensor::eye(na, opts).repeat_interleave_self_int(n_actions, 1, None);
        let deviated = qs.reshape([b, steps, 1, k]).expand([b, steps, na, k], false);
        let all = chosen.unsqueeze(3) * (1.0f64 - &own) + deviated * &own;
        let all = all.permute([0, 3, 1, 2]).reshape([b * k, steps, na]);

        let mixed = self.mixer.mix(&all, &inputs.repeat_interleave(k))?;
        Ok(mixed
            .reshape([b, k, steps, 1])
            .mean_dim(Some(&[1i64][..]), false, Kind::Float))
    }

    /// Mean joint value of the greedy joint action at step 0
    fn max_q_tot(&self, batch: &EpisodeBatch, mac_out: &Tensor) -> Result<f64> {
        let unavailable = batch.get(fields::AVAIL_ACTIONS)?.narrow(1, 0, 1).eq(0);
        let best = mac_out
            .detach()
            .narrow(1, 0, 1)
            .masked_fill(&unavailable, UNAVAILABLE_Q)
            .max_dim(3, false)
            .0;
        let state = batch.get_float(fields::STATE)?.narrow(1, 0, 1);
        let q = tch::no_grad(|| self.mixer.mix(&best, &MixerInput::State(state)))?;
        Ok(q.mean(Kind::Float).double_value(&[]))
    }
}

/// `filled` with `mask[t + 1] *= 1 - terminated[t]`
pub(crate) fn transition_mask(filled: &Tensor, terminated: &Tensor) -> Tensor {
    let steps = filled.size()[1];
    if steps < 2 {
        return filled.shallow_clone();
    }
    Tensor::cat(
        &[
            filled.narrow(1, 0, 1),
            filled.narrow(1, 1, steps - 1) * (1.0 - terminated.narrow(1, 0, steps - 1)),
        ],
        1,
    )
}

/// `r + gamma * (1 - terminated) * target_tot`, detached
pub(crate) fn td_targets(rewards: &Tensor, terminated: &Tensor, target_tot: &Tensor, gamma: f64) -> Tensor {
    (rewards + (1.0f64 - terminated) * target_tot * gamma).detach()
}

/// Per-agent bootstrap values `[B, t, na]` from next-step Qs.
///
/// With `double_q` the action is the live argmax and its value is read from
/// the target Qs; otherwise the target max. Unavailable actions never win.
pub(crate) fn bootstrap_qs(
    live_next: &Tensor,
    target_next: &Tensor,
    unavailable: &Tensor,
    double_q: bool,
) -> Tensor {
    let target_next = target_next.masked_fill(unavailable, UNAVAILABLE_Q);
    if double_q {
        let best = live_next
            .masked_fill(unavailable, UNAVAILABLE_Q)
            .argmax(3, true);
        target_next.gather(3, &best, false).squeeze_dim(3)
    } else {
        target_next.max_dim(3, false).0
    }
}

/// Mean squared TD error over unmasked steps, and the masked TD error
pub(crate) fn masked_td_loss(q_tot: &Tensor, targets: &Tensor, mask: &Tensor) -> (Tensor, Tensor) {
    let masked = (q_tot - targets) * mask;
    let loss = masked.pow_tensor_scalar(2.0).sum(Kind::Float) / mask.sum(Kind::Float).clamp_min(1.0);
    (loss, masked)
}

/// `weight * mean` of `clip((q_ref - q_i)^2 - q_tol, 0)` over violating
/// elements; zero when nothing violates.
pub(crate) fn local_constraint_loss(
    q_ref: &Tensor,
    chosen: &Tensor,
    mask: &Tensor,
    q_tol: f64,
    weight: f64,
) -> Tensor {
    let violation = ((q_ref.detach() - chosen).pow_tensor_scalar(2.0) - q_tol).clamp_min(0.0) * mask;
    let n_violating = violation.gt(0.0).sum(Kind::Float).double_value(&[]);
    if n_violating > 0.0 {
        violation.sum(Kind::Float) * (weight / n_violating)
    } else {
        Tensor::from(0.0f32).to_device(chosen.device())
    }
}

/// Within- and across-group taken-action Qs concatenated over agents
/// `[B, t, 2 * na]`, with the groups narrowed to the same steps
fn imagined_chosen(q: &QValues, actions: &Tensor, steps: i64) -> Option<(Tensor, ImagineGroups)> {
    match q {
        QValues::Imagined {
            within_group,
            across_group,
            groups,
            ..
        } => {
            let pick = |q: &Tensor| {
                q.narrow(1, 0, steps)
                    .gather(3, actions, false)
                    .squeeze_dim(3)
            };
            Some((
                Tensor::cat(&[pick(within_group), pick(across_group)], 2),
                groups.narrow_time(0, steps),
            ))
        }
        QValues::Plain(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn t3(values: &[f32], shape: [i64; 3]) -> Tensor {
        Tensor::from_slice(values).reshape(shape)
    }

    #[test]
    fn test_transition_mask_zeroes_after_termination() {
        let filled = t3(&[1.0, 1.0, 1.0, 1.0], [1, 4, 1]);
        let terminated = t3(&[0.0, 1.0, 0.0, 0.0], [1, 4, 1]);
        let mask = transition_mask(&filled, &terminated);
        let values: Vec<f32> = Vec::<f32>::try_from(mask.flatten(0, -1)).unwrap();
        assert_eq!(values, vec![1.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_terminated_step_does_not_bootstrap() {
        let rewards = t3(&[1.0, 2.0, 3.0], [1, 3, 1]);
        let terminated = t3(&[0.0, 1.0, 0.0], [1, 3, 1]);
        let target_tot = t3(&[10.0, 10.0, 10.0], [1, 3, 1]);

        let targets = td_targets(&rewards, &terminated, &target_tot, 0.5);
        let values: Vec<f32> = Vec::<f32>::try_from(targets.flatten(0, -1)).unwrap();
        assert_eq!(values, vec![6.0, 2.0, 8.0]);
    }

    #[test]
    fn test_double_q_reads_target_at_live_argmax() {
        // live prefers action 1, target prefers action 0
        let live = Tensor::from_slice(&[0.0f32, 5.0, 1.0]).reshape([1, 1, 1, 3]);
        let target = Tensor::from_slice(&[10.0f32, 2.0, 3.0]).reshape([1, 1, 1, 3]);
        let none = Tensor::zeros([1, 1, 1, 3], (Kind::Bool, Device::Cpu));

        let double = bootstrap_qs(&live, &target, &none, true);
        assert_eq!(double.double_value(&[0, 0, 0]), 2.0);
        let plain = bootstrap_qs(&live, &target, &none, false);
        assert_eq!(plain.double_value(&[0, 0, 0]), 10.0);
    }

    #[test]
    fn test_unavailable_actions_never_bootstrap() {
        let live = Tensor::from_slice(&[0.0f32, 5.0, 1.0]).reshape([1, 1, 1, 3]);
        let target = Tensor::from_slice(&[10.0f32, 2.0, 3.0]).reshape([1, 1, 1, 3]);
        let unavailable = Tensor::from_slice(&[true, true, false]).reshape([1, 1, 1, 3]);

        assert_eq!(bootstrap_qs(&live, &target, &unavailable, true).double_value(&[0, 0, 0]), 3.0);
        assert_eq!(bootstrap_qs(&live, &target, &unavailable, false).double_value(&[0, 0, 0]), 3.0);
    }

    #[test]
    fn test_padded_steps_are_excluded() {
        let q_tot = t3(&[1.0, 2.0, 100.0], [1, 3, 1]);
        let targets = t3(&[0.0, 0.0, 0.0], [1, 3, 1]);
        let mask = t3(&[1.0, 1.0, 0.0], [1, 3, 1]);

        let (loss, masked) = masked_td_loss(&q_tot, &targets, &mask);
        // (1 + 4) / 2
        assert!((loss.double_value(&[]) - 2.5).abs() < 1e-6);
        assert_eq!(masked.double_value(&[0, 2, 0]), 0.0);
    }

    #[test]
    fn test_local_constraint_averages_violations() {
        let q_ref = t3(&[0.0, 0.0], [1, 2, 1]);
        let chosen = t3(&[1.0, 0.0, 3.0, 0.0], [1, 2, 2]);
        let mask = t3(&[1.0, 1.0], [1, 2, 1]);

        // violations 1 and 9, tolerance 0.5 leaves 0.5 and 8.5
        let loss = local_constraint_loss(&q_ref, &chosen, &mask, 0.5, 2.0);
        assert!((loss.double_value(&[]) - 9.0).abs() < 1e-5);

        let loss = local_constraint_loss(&q_ref, &chosen, &mask, 100.0, 2.0);
        assert_eq!(loss.double_value(&[]), 0.0);
    }
}
