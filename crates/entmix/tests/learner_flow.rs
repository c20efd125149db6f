use entmix::prelude::*;
use std::sync::Arc;
use tch::{nn, Device, Kind, Tensor};

fn snapshot(vs: &nn::VarStore) -> Vec<(String, Tensor)> {
    let mut vars: Vec<(String, Tensor)> = vs
        .variables()
        .into_iter()
        .map(|(name, t)| (name, t.detach().copy()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    vars
}

fn distance(a: &[(String, Tensor)], b: &[(String, Tensor)]) -> f64 {
    assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b.iter())
        .map(|((na, ta), (nb, tb))| {
            assert_eq!(na, nb);
            (ta - tb).abs().sum(Kind::Float).double_value(&[])
        })
        .sum()
}

#[test]
fn test_vdn_single_update_logs_core_metrics() {
    let cfg = LearnerConfig {
        mixer: MixerKind::Vdn,
        entity_scheme: false,
        double_q: true,
        n_agents: 2,
        n_actions: 3,
        state_shape: 4,
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
    let mut learner = QLearner::new(
        move |path| Ok(MlpAgent::new(path, &agent_cfg)),
        cfg,
        logger.clone(),
    )
    .unwrap();

    // two episodes of three timesteps
    let batch = SyntheticBatch::state(2, 2, 2, 3, 4).build(Device::Cpu).unwrap();
    assert_eq!(batch.max_seq_length(), 3);

    let target_before = snapshot(learner.target_var_store());
    let live_before = snapshot(learner.var_store());
    learner.train(&batch, 0, 0).unwrap();

    assert_eq!(
        logger.names(),
        vec!["grad_norm", "loss", "q_taken_mean", "target_mean", "td_error_abs"]
    );
    let (step, grad_norm) = logger.last("grad_norm").unwrap();
    assert_eq!(step, 0);
    assert!(grad_norm > 0.0);
    assert!(logger.last("loss").unwrap().1.is_finite());

    assert_eq!(distance(&target_before, &snapshot(learner.target_var_store())), 0.0);
    assert!(distance(&live_before, &snapshot(learner.var_store())) > 0.0);
}

#[test]
fn test_entity_learner_trains_from_replay_with_padding() {
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
        learner_log_interval: 1,
        ..Default::default()
    };
    let agent_cfg = AgentConfig {
        entity_shape: 5,
        n_agents: 2,
        n_actions: 3,
        attn_embed_dim: 8,
        attn_n_heads: 2,
        rnn_hidden_dim: 8,
        ..Default::default()
    };
    let logger = Arc::new(RecordingLogger::new());
    let learner = QLearner::new(
        move |path| EntityAttentionAgent::new(path, &agent_cfg),
        cfg,
        logger.clone(),
    )
    .unwrap();

    let run = RunConfig {
        batch_size: 3,
        training_iters: 2,
        ..Default::default()
    };
    let mut buffer = ReplayBuffer::with_seed(16, 7, 3);
    let mut trainer = TrainingLoop::new(learner, run, "entity", Device::Cpu);

    for t in 1..=3u64 {
        let batch = SyntheticBatch::entity(2, 6, 2, 3, 4, 5)
            .with_filled(vec![3, 7])
            .build(Device::Cpu)
            .unwrap();
        buffer.insert_episode_batch(&batch).unwrap();
        trainer.record_episodes(2, 10);
        let trained = trainer.train_iteration(&mut buffer).unwrap();
        assert_eq!(trained, t >= 2);
    }

    // two updates per iteration, logged once per env step
    let losses = logger.history("loss");
    let steps: Vec<u64> = losses.iter().map(|(s, _)| *s).collect();
    assert_eq!(steps, vec![20, 30]);
    assert!(losses.iter().all(|(_, v)| v.is_finite()));
}

fn msg_configs(dir: &std::path::Path) -> (LearnerConfig, AgentConfig, RunConfig) {
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
        msg_t: 2,
        ceb_weight: 0.1,
        ..Default::default()
    };
    let agent_cfg = AgentConfig {
        entity_shape: 5,
        n_agents: 2,
        n_actions: 3,
        attn_embed_dim: 8,
        attn_n_heads: 2,
        rnn_hidden_dim: 8,
        msg_dim: Some(3),
        ..Default::default()
    };
    let run = RunConfig {
        batch_size: 2,
        save_model: true,
        save_model_interval: 8,
        local_results_path: dir.to_string_lossy().into_owned(),
        ..Default::default()
    };
    (cfg, agent_cfg, run)
}

fn msg_learner(
    cfg: LearnerConfig,
    agent_cfg: AgentConfig,
) -> MsgQLearner<EntityAttentionAgent> {
    let elector_cfg = agent_cfg.clone();
    MsgQLearner::new(
        move |path| EntityAttentionAgent::new(path, &agent_cfg),
        cfg,
        Arc::new(NoOpLogger),
    )
    .unwrap()
    .with_elector(move |path| AttentionElector::new(path, &elector_cfg))
    .unwrap()
}

#[test]
fn test_messaging_run_saves_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let (cfg, agent_cfg, run) = msg_configs(dir.path());

    let learner = msg_learner(cfg.clone(), agent_cfg.clone());
    let mut buffer = ReplayBuffer::with_seed(8, 5, 0);
    let mut trainer = TrainingLoop::new(learner, run.clone(), "msg", Device::Cpu);
    for _ in 0..2 {
        let batch = SyntheticBatch::entity(2, 4, 2, 3, 4, 5)
            .with_messages(3)
            .build(Device::Cpu)
            .unwrap();
        buffer.insert_episode_batch(&batch).unwrap();
        trainer.record_episodes(2, 8);
        assert!(trainer.train_iteration(&mut buffer).unwrap());
        trainer.maybe_save().unwrap();
    }
    let models = trainer.models_dir();
    let trained = trainer.finish();

    let manager = CheckpointManager::new(entmix::checkpoint::CheckpointConfig::new(&models));
    let steps: Vec<u64> = manager
        .list_checkpoints()
        .unwrap()
        .into_iter()
        .map(|(t, _)| t)
        .collect();
    assert_eq!(steps, vec![8, 16]);

    let mut resume_run = run;
    resume_run.checkpoint_path = models.to_string_lossy().into_owned();
    let fresh = msg_learner(cfg, agent_cfg);
    let mut resumed = TrainingLoop::new(fresh, resume_run, "msg-resumed", Device::Cpu);
    assert_eq!(resumed.resume().unwrap(), Some(16));
    assert_eq!(resumed.t_env(), 16);
    assert_eq!(resumed.episode(), 4);

    // nothing trained after the last save
    let loaded = resumed.learner();
    assert_eq!(distance(&snapshot(trained.var_store()), &snapshot(loaded.var_store())), 0.0);
    assert_eq!(
        distance(
            &snapshot(trained.elector_var_store().unwrap()),
            &snapshot(loaded.elector_var_store().unwrap())
        ),
        0.0
    );
}
