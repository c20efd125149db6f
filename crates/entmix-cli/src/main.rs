//! entmix CLI
//!
//! Write configs, run synthetic smoke trainings and inspect saved models.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use entmix::agent::{AttentionElector, EntityAttentionAgent, MlpAgent};
use entmix::batch::SyntheticBatch;
use entmix::checkpoint::{CheckpointConfig, CheckpointManager, CheckpointMeta};
use entmix::config::{ExperimentConfig, MixerKind};
use entmix::learner::{Learner, MsgQLearner, QLearner};
use entmix::log::{CompositeLogger, ConsoleLogger, MetricLogger, RecordingLogger};
use entmix::run::{ReplayBuffer, TrainingLoop};

#[derive(Parser)]
#[command(name = "entmix")]
#[command(version, about = "entmix - Multi-agent value decomposition over entity sets", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a default experiment config as JSON
    Config {
        /// Write to a file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,

        /// Mixer (vdn, qmix, flex_qmix, lin_flex_qmix, wvdn)
        #[arg(long, value_parser = parse_mixer)]
        mixer: Option<MixerKind>,
    },

    /// Train on random synthetic episodes to exercise the full pipeline
    Smoke {
        /// Experiment config (defaults when omitted)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Collect-and-train iterations
        #[arg(long, default_value = "5")]
        iterations: u64,

        /// Transitions per synthetic episode
        #[arg(long, default_value = "10")]
        steps: i64,

        /// Show a progress bar
        #[arg(long)]
        progress: bool,

        /// Also write statistics under <local_results_path>/tb_logs
        /// (needs the `tensorboard` feature)
        #[arg(long)]
        tensorboard: bool,
    },

    /// List saved timestep folders and the one a load step resolves to
    Checkpoints {
        /// Directory holding timestep folders
        dir: PathBuf,

        /// 0 resolves to the latest timestep
        #[arg(long, default_value = "0")]
        load_step: u64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config { output, mixer } => write_config(output, mixer)?,
        Commands::Smoke {
            config,
            iterations,
            steps,
            progress,
            tensorboard,
        } => smoke(config, iterations, steps, progress, tensorboard)?,
        Commands::Checkpoints { dir, load_step } => list_checkpoints(dir, load_step)?,
    }

    Ok(())
}

fn parse_mixer(s: &str) -> std::result::Result<MixerKind, String> {
    s.parse::<MixerKind>().map_err(|e| e.to_string())
}

fn write_config(output: Option<PathBuf>, mixer: Option<MixerKind>) -> Result<()> {
    let mut config = ExperimentConfig {
        name: "entmix".to_string(),
        ..Default::default()
    };
    if let Some(mixer) = mixer {
        config.learner.mixer = mixer;
        // qmix reads the flat state
        config.learner.entity_scheme = mixer != MixerKind::Qmix;
    }
    config.validate()?;
    match output {
        Some(path) => {
            config
                .to_json_file(&path)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("Wrote config to {}", path.display());
        }
        None => println!("{}", serde_json::to_string_pretty(&config)?),
    }
    Ok(())
}

fn smoke(
    config: Option<PathBuf>,
    iterations: u64,
    steps: i64,
    progress: bool,
    tensorboard: bool,
) -> Result<()> {
    let config = match config {
        Some(path) => ExperimentConfig::from_json_file(&path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => ExperimentConfig::default(),
    };
    config.validate()?;
    if steps < 1 {
        bail!("--steps must be at least 1");
    }
    entmix::utils::set_seed(config.run.seed);

    let device = if tch::Cuda::is_available() {
        tracing::info!("Using CUDA");
        tch::Device::Cuda(0)
    } else {
        tracing::info!("Using CPU");
        tch::Device::Cpu
    };
    let mut learner_cfg = config.learner.clone();
    learner_cfg.device = device;
    let stats = Arc::new(RecordingLogger::new());
    let mut composite = CompositeLogger::new(vec![
        Box::new(Arc::clone(&stats)),
        Box::new(ConsoleLogger::new()),
    ]);
    if tensorboard {
        composite.add(tensorboard_logger(&config)?);
    }
    let logger: Arc<dyn MetricLogger> = Arc::new(composite);
    let run = RunHandles {
        stats,
        logger: Arc::clone(&logger),
        device,
        iterations,
        steps,
        progress,
    };

    tracing::info!(
        name = %config.name,
        mixer = %learner_cfg.mixer,
        iterations,
        steps,
        "Starting smoke run"
    );

    let lc = &learner_cfg;
    let make_batch = |batch_size: i64| {
        let mut builder = if lc.entity_scheme {
            SyntheticBatch::entity(
                batch_size,
                steps,
                lc.n_agents,
                lc.n_actions,
                lc.n_entities,
                lc.entity_shape,
            )
        } else {
            SyntheticBatch::state(batch_size, steps, lc.n_agents, lc.n_actions, lc.state_shape)
        };
        if let Some(msg_dim) = config.agent.msg_dim {
            builder = builder.with_messages(msg_dim);
        }
        if lc.train_gt_factors || lc.test_gt_factors {
            builder = builder.with_gt_mask();
        }
        builder.build(device)
    };

    let agent_cfg = config.agent.clone();
    if !learner_cfg.entity_scheme {
        if agent_cfg.obs_shape != learner_cfg.state_shape {
            bail!(
                "state scheme smoke runs need agent.obs_shape ({}) == learner.state_shape ({})",
                agent_cfg.obs_shape,
                learner_cfg.state_shape
            );
        }
        let learner = QLearner::new(
            move |path| Ok(MlpAgent::new(path, &agent_cfg)),
            learner_cfg.clone(),
            logger,
        )?;
        drive(learner, &config, &run, make_batch)
    } else if agent_cfg.msg_dim.is_some() && !learner_cfg.no_summary {
        let elector_cfg = agent_cfg.clone();
        let learner = MsgQLearner::new(
            move |path| EntityAttentionAgent::new(path, &agent_cfg),
            learner_cfg.clone(),
            logger,
        )?
        .with_elector(move |path| AttentionElector::new(path, &elector_cfg))?;
        drive(learner, &config, &run, make_batch)
    } else {
        let learner = QLearner::new(
            move |path| EntityAttentionAgent::new(path, &agent_cfg),
            learner_cfg.clone(),
            logger,
        )?;
        drive(learner, &config, &run, make_batch)
    }
}

#[cfg(feature = "tensorboard")]
fn tensorboard_logger(config: &ExperimentConfig) -> Result<Box<dyn MetricLogger>> {
    let logger = entmix::log::TensorBoardLogger::for_run(&config.run.local_results_path, &token(config))?;
    tracing::info!(path = %logger.log_dir().display(), "Writing TensorBoard logs");
    Ok(Box::new(logger))
}

#[cfg(not(feature = "tensorboard"))]
fn tensorboard_logger(_config: &ExperimentConfig) -> Result<Box<dyn MetricLogger>> {
    bail!("built without the tensorboard feature")
}

fn token(config: &ExperimentConfig) -> String {
    if config.name.is_empty() {
        "smoke".to_string()
    } else {
        config.name.clone()
    }
}

/// Per-invocation settings shared by every learner variant
struct RunHandles {
    stats: Arc<RecordingLogger>,
    logger: Arc<dyn MetricLogger>,
    device: tch::Device,
    iterations: u64,
    steps: i64,
    progress: bool,
}

fn drive<L, F>(
    learner: L,
    config: &ExperimentConfig,
    handles: &RunHandles,
    make_batch: F,
) -> Result<()>
where
    L: Learner,
    F: Fn(i64) -> entmix::Result<entmix::batch::EpisodeBatch>,
{
    let (iterations, steps) = (handles.iterations, handles.steps);
    let run = &config.run;
    let episodes_per_iter = run.batch_size.max(1);
    let mut buffer = ReplayBuffer::with_seed(run.buffer_size.max(episodes_per_iter), steps + 1, run.seed);

    let mut run_cfg = run.clone();
    run_cfg.t_max = run_cfg.t_max.min(iterations * episodes_per_iter as u64 * steps as u64);
    let mut trainer = TrainingLoop::new(learner, run_cfg, token(config), handles.device)
        .with_stats(Arc::clone(&handles.stats));
    if handles.progress {
        trainer = trainer.with_progress();
    }
    trainer.resume()?;

    let mut updates = 0u64;
    for _ in 0..iterations {
        let batch = make_batch(episodes_per_iter as i64)?;
        buffer.insert_episode_batch(&batch)?;
        trainer.record_episodes(episodes_per_iter as u64, episodes_per_iter as u64 * steps as u64);

        if trainer.train_iteration(&mut buffer)? {
            updates += run.training_iters as u64;
        }
        trainer.maybe_save()?;
        trainer.maybe_log_progress();
        if trainer.is_done() {
            break;
        }
    }

    let t_env = trainer.t_env();
    let episode = trainer.episode();
    trainer.finish();
    handles.logger.close();
    println!(
        "Smoke run finished: t_env={} episodes={} updates={}",
        t_env, episode, updates
    );
    Ok(())
}

fn list_checkpoints(dir: PathBuf, load_step: u64) -> Result<()> {
    let manager = CheckpointManager::new(CheckpointConfig::new(&dir));
    let checkpoints = manager.list_checkpoints()?;
    if checkpoints.is_empty() {
        println!("No checkpoints under {}", dir.display());
        return Ok(());
    }

    println!("Checkpoints under {}:", dir.display());
    for (t_env, path) in &checkpoints {
        match CheckpointMeta::load(path)? {
            Some(meta) => println!("  {:>12}  episode {}", t_env, meta.episode),
            None => println!("  {:>12}", t_env),
        }
    }
    if let Some((t_env, path)) = manager.resolve(load_step)? {
        println!("load_step {} -> {} ({})", load_step, t_env, path.display());
    }
    Ok(())
}
