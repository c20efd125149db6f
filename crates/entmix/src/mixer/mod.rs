//! Monotonic value mixers.
//!
//! A mixer maps per-agent chosen Qs `[B, T, na]` plus global information to
//! a joint value `[B, T, 1]` that is non-decreasing in every agent Q.

mod flex_qmix;
mod qmix;
mod vdn;

pub use flex_qmix::{AttentionHyperNet, FlexQMixer, HyperMode, LinearFlexQMixer, WvdnMixer};
pub use qmix::QMixer;
pub use vdn::VdnMixer;

use crate::agent::ImagineGroups;
use crate::batch::{fields, EpisodeBatch};
use crate::config::{LearnerConfig, MixerKind};
use crate::{EntmixError, Result};
use tch::{nn, Tensor};

/// Global information handed to a mixer
pub enum MixerInput {
    State(Tensor),
    Entities { entities: Tensor, entity_mask: Tensor },
}

impl MixerInput {
    /// Inputs for steps `[0, T-1)` and `[1, T)`.
    ///
    /// Under `entity_last_action` each entity is extended with the one-hot
    /// action its agent took at the previous step (zeros at step 0 and for
    /// non-agent entities).
    pub fn from_batch(batch: &EpisodeBatch, cfg: &LearnerConfig) -> Result<(Self, Self)> {
        let t = batch.max_seq_length();
        if !cfg.entity_scheme {
            let state = batch.get_float(fields::STATE)?;
            return Ok((
                Self::State(state.narrow(1, 0, t - 1)),
                Self::State(state.narrow(1, 1, t - 1)),
            ));
        }

        let entity_mask = batch.get_float(fields::ENTITY_MASK)?;
        let entities = if cfg.entity_last_action {
            batch.entities_with_last_action(cfg.n_agents, cfg.n_actions)?
        } else {
            batch.get_float(fields::ENTITIES)?
        };

        Ok((
            Self::Entities {
                entities: entities.narrow(1, 0, t - 1),
                entity_mask: entity_mask.narrow(1, 0, t - 1),
            },
            Self::Entities {
                entities: entities.narrow(1, 1, t - 1),
                entity_mask: entity_mask.narrow(1, 1, t - 1),
            },
        ))
    }

    /// Repeat every episode `n` times consecutively (episode `b` lands at
    /// rows `b * n .. (b + 1) * n`).
    pub fn repeat_interleave(&self, n: i64) -> Self {
        match self {
            Self::State(state) => Self::State(state.repeat_interleave_self_int(n, 0, None)),
            Self::Entities {
                entities,
                entity_mask,
            } => Self::Entities {
                entities: entities.repeat_interleave_self_int(n, 0, None),
                entity_mask: entity_mask.repeat_interleave_self_int(n, 0, None),
            },
        }
    }

    /// Narrow the time axis
    pub fn narrow_time(&self, start: i64, len: i64) -> Self {
        match self {
            Self::State(state) => Self::State(state.narrow(1, start, len)),
            Self::Entities {
                entities,
                entity_mask,
            } => Self::Entities {
                entities: entities.narrow(1, start, len),
                entity_mask: entity_mask.narrow(1, start, len),
            },
        }
    }

    pub(crate) fn state(&self) -> Result<&Tensor> {
        match self {
            Self::State(state) => Ok(state),
            Self::Entities { .. } => Err(EntmixError::Config(
                "mixer needs state inputs, got entities".into(),
            )),
        }
    }

    pub(crate) fn entities(&self) -> Result<(&Tensor, &Tensor)> {
        match self {
            Self::Entities {
                entities,
                entity_mask,
            } => Ok((entities, entity_mask)),
            Self::State(_) => Err(EntmixError::Config(
                "mixer needs entity inputs, got state".into(),
            )),
        }
    }
}

/// Trait for joint-value mixers
pub trait Mixer {
    /// `agent_qs [B, T, na]` → `[B, T, 1]`
    fn mix(&self, agent_qs: &Tensor, inputs: &MixerInput) -> Result<Tensor>;

    /// Mix within-group and across-group Qs concatenated over the agent axis
    /// (`[B, T, 2 * na]`). With `want_prop`, also returns the mean share of
    /// first-layer weight mass held by the within-group half.
    fn mix_imagined(
        &self,
        agent_qs: &Tensor,
        inputs: &MixerInput,
        groups: &ImagineGroups,
        want_prop: bool,
    ) -> Result<(Tensor, Option<Tensor>)>;

    /// Whether `mix_imagined` is available
    fn supports_imagine(&self) -> bool {
        true
    }
}

/// Build the mixer named by `cfg.mixer` under `path`.
///
/// Live and target mixers are built by this one factory so their parameter
/// names line up.
pub fn build_mixer(cfg: &LearnerConfig, path: nn::Path) -> Result<Box<dyn Mixer>> {
    if cfg.mixer.requires_entity_scheme() && !cfg.entity_scheme {
        return Err(EntmixError::Config(format!(
            "{} only available with entity scheme",
            cfg.mixer
        )));
    }
    Ok(match cfg.mixer {
        MixerKind::Vdn => Box::new(VdnMixer::new(cfg.n_agents)),
        MixerKind::Qmix => Box::new(QMixer::new(path, cfg)?),
        MixerKind::FlexQmix => Box::new(FlexQMixer::new(path, cfg)?),
        MixerKind::LinFlexQmix => Box::new(LinearFlexQMixer::new(path, cfg)?),
        MixerKind::Wvdn => Box::new(WvdnMixer::new(path, cfg)?),
    })
}

pub(crate) fn check_agent_qs(agent_qs: &Tensor, n: i64) -> Result<(i64, i64)> {
    let size = agent_qs.size();
    if size.len() != 3 || size[2] != n {
        return Err(EntmixError::ShapeMismatch {
            field: "agent_qs".into(),
            expected: vec![-1, -1, n],
            actual: size,
        });
    }
    Ok((size[0], size[1]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::SyntheticBatch;
    use tch::{nn::VarStore, Device, Kind};

    fn cfg(mixer: MixerKind, entity_scheme: bool) -> LearnerConfig {
        LearnerConfig {
            mixer,
            entity_scheme,
            n_agents: 2,
            n_actions: 3,
            n_entities: 4,
            entity_shape: 5,
            state_shape: 6,
            mixing_embed_dim: 8,
            hypernet_embed: 8,
            attn_n_heads: 2,
            attn_embed_dim: 8,
            ..Default::default()
        }
    }

    fn inputs(cfg: &LearnerConfig) -> (MixerInput, i64, i64) {
        let batch = if cfg.entity_scheme {
            SyntheticBatch::entity(3, 4, cfg.n_agents, cfg.n_actions, cfg.n_entities, cfg.entity_shape)
        } else {
            SyntheticBatch::state(3, 4, cfg.n_agents, cfg.n_actions, cfg.state_shape)
        }
        .build(Device::Cpu)
        .unwrap();
        let (ins, _) = MixerInput::from_batch(&batch, cfg).unwrap();
        (ins, 3, 4)
    }

    #[test]
    fn test_entity_mixer_requires_entity_scheme() {
        let vs = VarStore::new(Device::Cpu);
        for kind in [MixerKind::FlexQmix, MixerKind::LinFlexQmix, MixerKind::Wvdn] {
            let err = build_mixer(&cfg(kind, false), vs.root() / "mixer").err().unwrap();
            assert!(err.to_string().contains("only available with entity scheme"));
        }
    }

    #[test]
    fn test_last_action_entities() {
        let c = cfg(MixerKind::FlexQmix, true);
        let batch = SyntheticBatch::entity(2, 3, 2, 3, 4, 5).build(Device::Cpu).unwrap();
        let (now, next) = MixerInput::from_batch(&batch, &c).unwrap();
        let (entities, mask) = now.entities().unwrap();
        assert_eq!(entities.size(), vec![2, 3, 4, 5 + 3]);
        assert_eq!(mask.size(), vec![2, 3, 4]);

        // step 0 has no previous action, step 1 carries the action of step 0
        let tail = entities.narrow(3, 5, 3);
        assert_eq!(tail.get(0).get(0).sum(Kind::Float).double_value(&[]), 0.0);
        let onehot = batch.actions_onehot(3).unwrap();
        let diff = tail.narrow(1, 1, 1).narrow(2, 0, 2) - onehot.narrow(1, 0, 1);
        assert_eq!(diff.abs().sum(Kind::Float).double_value(&[]), 0.0);
        assert!(next.state().is_err());
    }

    #[test]
    fn test_mixers_are_monotonic() {
        for (kind, entity) in [
            (MixerKind::Vdn, false),
            (MixerKind::Qmix, false),
            (MixerKind::FlexQmix, true),
            (MixerKind::LinFlexQmix, true),
            (MixerKind::Wvdn, true),
        ] {
            let c = cfg(kind, entity);
            let vs = VarStore::new(Device::Cpu);
            let mixer = build_mixer(&c, vs.root() / "mixer").unwrap();
            let (ins, b, t) = inputs(&c);

            let qs = Tensor::randn([b, t, 2], (Kind::Float, Device::Cpu));
            let base = mixer.mix(&qs, &ins).unwrap();
            assert_eq!(base.size(), vec![b, t, 1], "{}", kind);

            let bumped = mixer.mix(&(&qs + 1.0), &ins).unwrap();
            let min_gain = (bumped - base).min().double_value(&[]);
            assert!(min_gain >= -1e-5, "{} decreased by {}", kind, min_gain);
        }
    }

    #[test]
    fn test_imagined_mixing() {
        for kind in [MixerKind::Vdn, MixerKind::FlexQmix, MixerKind::LinFlexQmix, MixerKind::Wvdn] {
            let c = cfg(kind, true);
            let vs = VarStore::new(Device::Cpu);
            let mixer = build_mixer(&c, vs.root() / "mixer").unwrap();
            let (ins, b, t) = inputs(&c);
            let opts = (Kind::Float, Device::Cpu);

            let within = Tensor::rand([b, t, 2, 4], opts).lt(0.5).to_kind(Kind::Float);
            let groups = ImagineGroups {
                across: 1.0 - &within,
                within,
            };
            let qs = Tensor::randn([b, t, 4], opts);
            let (q_tot, prop) = mixer.mix_imagined(&qs, &ins, &groups, true).unwrap();
            assert_eq!(q_tot.size(), vec![b, t, 1], "{}", kind);
            let prop = prop.unwrap().double_value(&[]);
            assert!((0.0..=1.0).contains(&prop), "{} prop {}", kind, prop);
        }
    }

    #[test]
    fn test_qmix_rejects_imagine() {
        let c = cfg(MixerKind::Qmix, false);
        let vs = VarStore::new(Device::Cpu);
        let mixer = build_mixer(&c, vs.root() / "mixer").unwrap();
        assert!(!mixer.supports_imagine());
    }
}
