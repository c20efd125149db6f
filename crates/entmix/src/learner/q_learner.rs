use super::td::TdCore;
use super::Learner;
use crate::agent::AgentNetwork;
use crate::batch::EpisodeBatch;
use crate::config::LearnerConfig;
use crate::log::MetricLogger;
use crate::Result;
use std::path::Path;
use std::sync::Arc;
use tch::nn;

/// Q-learning through a monotonic mixer.
///
/// Live and target agents come from the same factory; the target side is a
/// hard copy refreshed every `target_update_interval` episodes.
pub struct QLearner<A> {
    core: TdCore<A>,
}

impl<A: AgentNetwork> QLearner<A> {
    /// Build live and target networks. `agent_factory` is called twice with
    /// paths of the same name in separate stores.
    pub fn new<F>(agent_factory: F, cfg: LearnerConfig, logger: Arc<dyn MetricLogger>) -> Result<Self>
    where
        F: Fn(nn::Path) -> Result<A>,
    {
        Ok(Self {
            core: TdCore::new(agent_factory, cfg, logger)?,
        })
    }

    pub fn config(&self) -> &LearnerConfig {
        &self.core.cfg
    }

    pub fn agent(&self) -> &A {
        self.core.agent()
    }

    /// Store holding the live agent (`agent.*`) and mixer (`mixer.*`)
    pub fn var_store(&self) -> &nn::VarStore {
        self.core.var_store()
    }

    pub fn target_var_store(&self) -> &nn::VarStore {
        self.core.target_var_store()
    }

    /// Force a hard target update
    pub fn update_targets(&mut self) -> Result<()> {
        self.core.update_targets()
    }
}

impl<A: AgentNetwork> Learner for QLearner<A> {
    fn train(&mut self, batch: &EpisodeBatch, t_env: u64, episode_num: u64) -> Result<()> {
        let will_log = self.core.will_log(t_env);
        let pass = self.core.td_pass(batch, false, will_log)?;
        self.core
            .apply(&pass.loss, pass.stats, t_env, episode_num, will_log)?;
        Ok(())
    }

    fn save_models(&self, dir: &Path) -> Result<()> {
        self.core.save(dir)
    }

    fn load_models(&mut self, dir: &Path, evaluate: bool) -> Result<()> {
        self.core.load(dir, evaluate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{EntityAttentionAgent, MlpAgent};
    use crate::batch::SyntheticBatch;
    use crate::config::{AgentConfig, MixerKind};
    use crate::log::RecordingLogger;
    use crate::nn::PoolingType;
    use tch::{Device, Kind};

    fn state_setup(interval: u64) -> (QLearner<MlpAgent>, Arc<RecordingLogger>) {
        let cfg = LearnerConfig {
            mixer: MixerKind::Vdn,
            entity_scheme: false,
            n_agents: 2,
            n_actions: 3,
            state_shape: 4,
            target_update_interval: interval,
            ..Default::default()
        };
        let agent_cfg = AgentConfig {
            n_agents: 2,
            n_actions: 3,
            obs_shape: 4,
            rnn_hidden_dim: 8,
            ..Default::default()
        };
        let logger = Arc::new(RecordingLogger::new());
        let learner = QLearner::new(
            move |path| Ok(MlpAgent::new(path, &agent_cfg)),
            cfg,
            logger.clone(),
        )
        .unwrap();
        (learner, logger)
    }

    fn distance(a: &nn::VarStore, b: &nn::VarStore) -> f64 {
        let b_vars = b.variables();
        a.variables()
            .iter()
            .map(|(name, t)| {
                (t - &b_vars[name])
                    .abs()
                    .sum(Kind::Float)
                    .double_value(&[])
            })
            .sum()
    }

    #[test]
    fn test_target_sync_cadence() {
        let (mut learner, _) = state_setup(3);
        let batch = SyntheticBatch::state(4, 3, 2, 3, 4).build(Device::Cpu).unwrap();

        for episode in [0, 1, 2] {
            learner.train(&batch, episode, episode).unwrap();
            assert!(
                distance(learner.var_store(), learner.target_var_store()) > 0.0,
                "target moved at episode {}",
                episode
            );
        }
        learner.train(&batch, 3, 3).unwrap();
        assert_eq!(distance(learner.var_store(), learner.target_var_store()), 0.0);
    }

    #[test]
    fn test_log_cadence() {
        let (mut learner, logger) = state_setup(200);
        let batch = SyntheticBatch::state(2, 3, 2, 3, 4).build(Device::Cpu).unwrap();
        learner.core.cfg.learner_log_interval = 100;

        learner.train(&batch, 0, 0).unwrap();
        learner.train(&batch, 50, 1).unwrap();
        learner.train(&batch, 100, 2).unwrap();
        let steps: Vec<u64> = logger.history("loss").iter().map(|(s, _)| *s).collect();
        assert_eq!(steps, vec![0, 100]);
    }

    #[test]
    fn test_one_step_episodes_log_max_qtot() {
        let (mut learner, logger) = state_setup(200);
        let batch = SyntheticBatch::state(3, 1, 2, 3, 4).build(Device::Cpu).unwrap();
        learner.train(&batch, 0, 0).unwrap();
        assert!(logger.last("max_qtot").is_some());
    }

    #[test]
    fn test_local_constraint_with_deviation_average() {
        let (mut learner, logger) = state_setup(200);
        learner.core.cfg.local_constraint = true;
        learner.core.cfg.ave_tot = true;
        let batch = SyntheticBatch::state(2, 3, 2, 3, 4).build(Device::Cpu).unwrap();

        learner.train(&batch, 0, 0).unwrap();
        for name in ["local_loss", "min_local_taken_q", "max_local_taken_q"] {
            assert!(logger.last(name).is_some(), "missing {}", name);
        }
        let (_, min_q) = logger.last("min_local_taken_q").unwrap();
        let (_, max_q) = logger.last("max_local_taken_q").unwrap();
        assert!(min_q <= max_q);
    }

    #[test]
    fn test_terminal_transition_target_is_reward() {
        let (mut learner, logger) = state_setup(200);
        let batch = SyntheticBatch::state(2, 1, 2, 3, 4)
            .with_termination(0)
            .build(Device::Cpu)
            .unwrap();
        learner.train(&batch, 0, 0).unwrap();

        let reward = batch
            .get_float(crate::batch::fields::REWARD)
            .unwrap()
            .narrow(1, 0, 1)
            .mean(Kind::Float)
            .double_value(&[]);
        let (_, target_mean) = logger.last("target_mean").unwrap();
        assert!((target_mean - reward / 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_pooling_agent_trains() {
        let cfg = LearnerConfig {
            mixer: MixerKind::FlexQmix,
            n_agents: 2,
            n_actions: 3,
            n_entities: 4,
            entity_shape: 5,
            mixing_embed_dim: 8,
            hypernet_embed: 8,
            attn_n_heads: 2,
            attn_embed_dim: 8,
            ..Default::default()
        };
        let agent_cfg = AgentConfig {
            entity_shape: 5,
            n_agents: 2,
            n_actions: 3,
            attn_embed_dim: 8,
            attn_n_heads: 2,
            rnn_hidden_dim: 8,
            pooling: Some(PoolingType::Max),
            ..Default::default()
        };
        let logger = Arc::new(RecordingLogger::new());
        let mut learner = QLearner::new(
            move |path| EntityAttentionAgent::new(path, &agent_cfg),
            cfg,
            logger.clone(),
        )
        .unwrap();
        let vars = learner.var_store().variables();
        assert!(vars.keys().any(|name| name.starts_with("agent.pool.")));
        assert!(!vars.keys().any(|name| name.starts_with("agent.attn.")));

        let batch = SyntheticBatch::entity(2, 3, 2, 3, 4, 5)
            .with_absent_prob(0.3)
            .build(Device::Cpu)
            .unwrap();
        let before = learner.var_store().variables()["agent.pool.out_trans.weight"].copy();
        learner.train(&batch, 0, 0).unwrap();

        let (_, loss) = logger.last("loss").unwrap();
        assert!(loss.is_finite());
        let after = &learner.var_store().variables()["agent.pool.out_trans.weight"];
        assert!((after - before).abs().sum(Kind::Float).double_value(&[]) > 0.0);
    }

    #[test]
    fn test_imagine_training_logs_group_proportions() {
        let cfg = LearnerConfig {
            mixer: MixerKind::FlexQmix,
            n_agents: 2,
            n_actions: 3,
            n_entities: 4,
            entity_shape: 5,
            mixing_embed_dim: 8,
            hypernet_embed: 8,
            attn_n_heads: 2,
            attn_embed_dim: 8,
            test_gt_factors: true,
            ..Default::default()
        };
        let agent_cfg = AgentConfig {
            entity_shape: 5,
            n_agents: 2,
            n_actions: 3,
            attn_embed_dim: 8,
            attn_n_heads: 2,
            rnn_hidden_dim: 8,
            imagine: true,
            ..Default::default()
        };
        let logger = Arc::new(RecordingLogger::new());
        let mut learner = QLearner::new(
            move |path| EntityAttentionAgent::new(path, &agent_cfg),
            cfg,
            logger.clone(),
        )
        .unwrap();
        let batch = SyntheticBatch::entity(2, 3, 2, 3, 4, 5)
            .with_gt_mask()
            .build(Device::Cpu)
            .unwrap();

        learner.train(&batch, 0, 0).unwrap();
        assert!(logger.last("im_loss").is_some());
        for name in ["ingroup_prop", "gt_ingroup_prop"] {
            let (_, prop) = logger.last(name).unwrap();
            assert!((0.0..=1.0).contains(&prop), "{} = {}", name, prop);
        }
    }

    #[test]
    fn test_imagine_agent_rejects_qmix() {
        let cfg = LearnerConfig {
            mixer: MixerKind::Qmix,
            entity_scheme: false,
            n_agents: 2,
            n_actions: 3,
            ..Default::default()
        };
        let agent_cfg = AgentConfig {
            entity_shape: 5,
            n_agents: 2,
            n_actions: 3,
            attn_embed_dim: 8,
            attn_n_heads: 2,
            rnn_hidden_dim: 8,
            imagine: true,
            ..Default::default()
        };
        let result = QLearner::new(
            move |path| EntityAttentionAgent::new(path, &agent_cfg),
            cfg,
            Arc::new(RecordingLogger::new()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_save_and_load_models() {
        let dir = tempfile::tempdir().unwrap();
        let (mut learner, _) = state_setup(200);
        let batch = SyntheticBatch::state(2, 3, 2, 3, 4).build(Device::Cpu).unwrap();
        learner.train(&batch, 0, 0).unwrap();
        learner.save_models(dir.path()).unwrap();
        assert!(dir.path().join("agent.th").exists());
        assert!(dir.path().join("opt.th").exists());

        let (mut fresh, _) = state_setup(200);
        fresh.load_models(dir.path(), false).unwrap();
        assert_eq!(distance(learner.var_store(), fresh.var_store()), 0.0);
        assert_eq!(distance(fresh.var_store(), fresh.target_var_store()), 0.0);
    }
}
