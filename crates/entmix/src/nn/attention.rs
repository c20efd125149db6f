//! Masked multi-head attention over a variable-size entity set.

use crate::{EntmixError, Result};
use tch::{nn, nn::Module, Kind, Tensor};

/// How per-head attention logits are reduced when returned
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeadReduce {
    Max,
    Mean,
}

/// Optional extras for [`EntityAttentionLayer::forward_with`]
#[derive(Clone, Copy, Default)]
pub struct AttentionOptions<'a> {
    /// Return raw (pre-softmax, unmasked) logits reduced across heads
    pub logits: Option<HeadReduce>,
    /// Return attention weights `[bs, n_heads, nq, ne]`
    pub weights: bool,
    /// Keep only this fraction of the valid entities per query
    pub rank_percent: Option<f64>,
    /// `[bs, ne]`, 1 = absent; counts valid entities for `rank_percent`
    pub entity_mask: Option<&'a Tensor>,
}

pub struct AttentionOutput {
    /// `[bs, nq, out_dim]`
    pub out: Tensor,
    pub logits: Option<Tensor>,
    pub weights: Option<Tensor>,
    /// Union of the pre-mask and the rank mask, `[bs * n_heads, nq, ne]`
    pub refined_mask: Option<Tensor>,
}

/// Scaled dot-product attention where the first `nq` entities are queries.
///
/// Masks use `1 = masked`. Query rows that are post-masked or that could not
/// attend to any entity come out as exact zeros.
#[derive(Debug)]
pub struct EntityAttentionLayer {
    in_trans: nn::Linear,
    out_trans: nn::Linear,
    n_heads: i64,
    head_dim: i64,
    embed_dim: i64,
    out_dim: i64,
}

impl EntityAttentionLayer {
    pub fn new(
        path: nn::Path,
        in_dim: i64,
        embed_dim: i64,
        out_dim: i64,
        n_heads: i64,
    ) -> Result<Self> {
        if n_heads < 1 || embed_dim % n_heads != 0 {
            return Err(EntmixError::Config(format!(
                "embed dim {} must be divisible by {} heads",
                embed_dim, n_heads
            )));
        }
        let in_trans = nn::linear(
            &path / "in_trans",
            in_dim,
            embed_dim * 3,
            nn::LinearConfig {
                bias: false,
                ..Default::default()
            },
        );
        let out_trans = nn::linear(&path / "out_trans", embed_dim, out_dim, Default::default());

        Ok(Self {
            in_trans,
            out_trans,
            n_heads,
            head_dim: embed_dim / n_heads,
            embed_dim,
            out_dim,
        })
    }

    pub fn n_heads(&self) -> i64 {
        self.n_heads
    }

    pub fn out_dim(&self) -> i64 {
        self.out_dim
    }

    /// `entities [bs, ne, in_dim]`, `pre_mask [bs, >=nq, ne]`,
    /// `post_mask [bs, nq]` → `[bs, nq, out_dim]`
    pub fn forward(&self, entities: &Tensor, pre_mask: Option<&Tensor>, post_mask: &Tensor) -> Tensor {
        // Without rank masking there is nothing fallible.
        let (out, _) = self.attend(entities, pre_mask, post_mask, None);
        out.out
    }

    pub fn forward_with(
        &self,
        entities: &Tensor,
        pre_mask: Option<&Tensor>,
        post_mask: &Tensor,
        options: AttentionOptions<'_>,
    ) -> Result<AttentionOutput> {
        let rank = match (options.rank_percent, options.entity_mask) {
            (None, _) => None,
            (Some(r), Some(entity_mask)) => {
                if !(0.0..=1.0).contains(&r) {
                    return Err(EntmixError::Config(format!(
                        "rank_percent must lie in [0, 1], got {}",
                        r
                    )));
                }
                Some((r, entity_mask))
            }
            (Some(_), None) => {
                return Err(EntmixError::Config(
                    "rank_percent needs an entity mask".into(),
                ))
            }
        };

        let (mut out, raw_logits) = self.attend(entities, pre_mask, post_mask, rank);
        let bs = entities.size()[0];
        let nq = post_mask.size()[1];
        let ne = entities.size()[1];

        if let Some(reduce) = options.logits {
            let per_head = raw_logits.reshape([bs, self.n_heads, nq, ne]);
            out.logits = Some(match reduce {
                HeadReduce::Max => per_head.max_dim(1, false).0,
                HeadReduce::Mean => per_head.mean_dim(Some(&[1i64][..]), false, Kind::Float),
            });
        }
        if !options.weights {
            out.weights = None;
        }
        Ok(out)
    }

    fn attend(
        &self,
        entities: &Tensor,
        pre_mask: Option<&Tensor>,
        post_mask: &Tensor,
        rank: Option<(f64, &Tensor)>,
    ) -> (AttentionOutput, Tensor) {
        let size = entities.size();
        let (bs, ne) = (size[0], size[1]);
        let nq = post_mask.size()[1];
        let (nh, hd) = (self.n_heads, self.head_dim);
        let bh = bs * nh;

        let qkv = self.in_trans.forward(entities).chunk(3, 2);
        // [bs, n, ed] -> [bs * nh, n, hd], heads ordered b * nh + h
        let split = |t: &Tensor, n: i64| {
            t.reshape([bs, n, nh, hd])
                .permute([0, 2, 1, 3])
                .reshape([bh, n, hd])
        };
        let query = split(&qkv[0].narrow(1, 0, nq), nq);
        let key = split(&qkv[1], ne);
        let value = split(&qkv[2], ne);

        let logits = query.bmm(&key.transpose(1, 2)) / (hd as f64).sqrt();

        let mut mask = pre_mask.map(|m| {
            let m = m.narrow(1, 0, nq).narrow(2, 0, ne).to_kind(Kind::Float);
            if m.size()[0] == bh {
                m
            } else {
                m.repeat_interleave_self_int(nh, 0, None)
            }
        });

        let mut refined_mask = None;
        if let Some((r, entity_mask)) = rank {
            let base = mask
                .as_ref()
                .map(|m| m.shallow_clone())
                .unwrap_or_else(|| logits.zeros_like());
            let rank_mask = tch::no_grad(|| {
                let masked = logits.masked_fill(&base.gt(0.5), f64::NEG_INFINITY);
                Self::rank_mask(&masked, entity_mask, r, nh)
            });
            let union = (&base + rank_mask).clamp_max(1.0);
            refined_mask = Some(union.shallow_clone());
            mask = Some(union);
        }

        let masked_logits = match &mask {
            Some(m) => logits.masked_fill(&m.gt(0.5), f64::NEG_INFINITY),
            None => logits.shallow_clone(),
        };
        let weights = masked_logits.softmax(2, Kind::Float);
        // fully masked rows produce NaN
        let weights = weights.masked_fill(&weights.isnan(), 0.0);

        let outs = weights
            .bmm(&value)
            .reshape([bs, nh, nq, hd])
            .permute([0, 2, 1, 3])
            .reshape([bs, nq, self.embed_dim]);
        let outs = self.out_trans.forward(&outs);

        let mut zero_rows = post_mask.narrow(1, 0, nq).gt(0.5);
        if let Some(m) = &mask {
            let blind_heads = m
                .sum_dim_intlist([2i64].as_slice(), false, Kind::Float)
                .ge(ne as f64)
                .to_kind(Kind::Float)
                .reshape([bs, nh, nq])
                .sum_dim_intlist([1i64].as_slice(), false, Kind::Float);
            zero_rows = zero_rows.logical_or(&blind_heads.ge(nh as f64));
        }
        let outs = outs.masked_fill(&zero_rows.unsqueeze(2), 0.0);

        (
            AttentionOutput {
                out: outs,
                logits: None,
                weights: Some(weights.reshape([bs, nh, nq, ne])),
                refined_mask,
            },
            logits,
        )
    }

    /// Mask everything outside the top `ceil(r * valid)` logits of each query.
    fn rank_mask(masked_logits: &Tensor, entity_mask: &Tensor, r: f64, nh: i64) -> Tensor {
        let size = masked_logits.size();
        let (bh, nq, ne) = (size[0], size[1], size[2]);
        let device = masked_logits.device();

        let valid = (1.0f64 - entity_mask.to_kind(Kind::Float)).sum_dim_intlist(
            [1i64].as_slice(),
            false,
            Kind::Float,
        );
        let first_kept = (valid * r).ceil().neg() + ne as f64;

        // ascending sort: the last ceil(r * valid) sorted positions survive
        let (_, order) = masked_logits.sort(2, false);
        let positions = Tensor::arange(ne, (Kind::Float, device)).unsqueeze(0);
        let drop_sorted = positions
            .lt_tensor(&first_kept.unsqueeze(1))
            .to_kind(Kind::Float)
            .repeat_interleave_self_int(nh, 0, None)
            .unsqueeze(1)
            .expand([bh, nq, ne], false)
            .contiguous();

        Tensor::zeros([bh, nq, ne], (Kind::Float, device)).scatter(2, &order, &drop_sorted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, nn::VarStore};

    fn layer(vs: &VarStore, in_dim: i64, heads: i64) -> EntityAttentionLayer {
        EntityAttentionLayer::new(vs.root() / "attn", in_dim, 8, in_dim, heads).unwrap()
    }

    #[test]
    fn test_indivisible_heads() {
        let vs = VarStore::new(Device::Cpu);
        assert!(matches!(
            EntityAttentionLayer::new(vs.root(), 4, 10, 4, 3),
            Err(EntmixError::Config(_))
        ));
    }

    #[test]
    fn test_post_masked_rows_are_zero() {
        let vs = VarStore::new(Device::Cpu);
        let attn = layer(&vs, 5, 2);
        let entities = Tensor::randn([3, 4, 5], (Kind::Float, Device::Cpu));
        let pre = Tensor::zeros([3, 4, 4], (Kind::Float, Device::Cpu));
        let post = Tensor::from_slice(&[0.0f32, 1.0, 0.0, 0.0, 1.0, 1.0]).reshape([3, 2]);

        let out = attn.forward(&entities, Some(&pre), &post);
        assert_eq!(out.size(), vec![3, 2, 5]);
        assert_eq!(out.get(0).get(1).abs().sum(Kind::Float).double_value(&[]), 0.0);
        assert_eq!(out.get(2).abs().sum(Kind::Float).double_value(&[]), 0.0);
        assert!(out.get(0).get(0).abs().sum(Kind::Float).double_value(&[]) > 0.0);
    }

    #[test]
    fn test_fully_pre_masked_rows_are_zero_not_nan() {
        let vs = VarStore::new(Device::Cpu);
        let attn = layer(&vs, 5, 2);
        let entities = Tensor::randn([1, 4, 5], (Kind::Float, Device::Cpu));
        let pre = Tensor::zeros([1, 4, 4], (Kind::Float, Device::Cpu));
        let _ = pre.get(0).get(1).fill_(1.0);
        let post = Tensor::zeros([1, 2], (Kind::Float, Device::Cpu));

        let out = attn
            .forward_with(
                &entities,
                Some(&pre),
                &post,
                AttentionOptions {
                    weights: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(out.out.isnan().sum(Kind::Int64).int64_value(&[]), 0);
        assert_eq!(out.out.get(0).get(1).abs().sum(Kind::Float).double_value(&[]), 0.0);

        // weights sum to one for the live query, zero for the blind one
        let sums = out
            .weights
            .unwrap()
            .sum_dim_intlist([3i64].as_slice(), false, Kind::Float);
        assert!((sums.double_value(&[0, 0, 0]) - 1.0).abs() < 1e-5);
        assert_eq!(sums.double_value(&[0, 1, 1]), 0.0);
    }

    #[test]
    fn test_masked_entities_get_no_weight() {
        let vs = VarStore::new(Device::Cpu);
        let attn = layer(&vs, 3, 1);
        let entities = Tensor::randn([1, 3, 3], (Kind::Float, Device::Cpu));
        let pre = Tensor::from_slice(&[0.0f32, 0.0, 1.0]).reshape([1, 1, 3]);
        let post = Tensor::zeros([1, 1], (Kind::Float, Device::Cpu));

        let out = attn
            .forward_with(
                &entities,
                Some(&pre),
                &post,
                AttentionOptions {
                    weights: true,
                    logits: Some(HeadReduce::Max),
                    ..Default::default()
                },
            )
            .unwrap();
        let weights = out.weights.unwrap();
        assert_eq!(weights.double_value(&[0, 0, 0, 2]), 0.0);
        assert_eq!(out.logits.unwrap().size(), vec![1, 1, 3]);
    }

    #[test]
    fn test_rank_percent_bounds() {
        let vs = VarStore::new(Device::Cpu);
        let attn = layer(&vs, 5, 2);
        let opts = (Kind::Float, Device::Cpu);
        let entities = Tensor::randn([2, 5, 5], opts);
        let entity_mask = Tensor::from_slice(&[0.0f32, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0])
            .reshape([2, 5]);
        let pre = (entity_mask.unsqueeze(1).repeat([1, 5, 1]) + entity_mask.unsqueeze(2))
            .clamp_max(1.0);
        let post = entity_mask.narrow(1, 0, 2);

        let full = attn
            .forward_with(
                &entities,
                Some(&pre),
                &post,
                AttentionOptions {
                    rank_percent: Some(1.0),
                    entity_mask: Some(&entity_mask),
                    ..Default::default()
                },
            )
            .unwrap();
        let expected = pre.narrow(1, 0, 2).repeat_interleave_self_int(2, 0, None);
        let refined = full.refined_mask.unwrap();
        assert_eq!(
            (refined - expected).abs().sum(Kind::Float).double_value(&[]),
            0.0
        );

        let none = attn
            .forward_with(
                &entities,
                Some(&pre),
                &post,
                AttentionOptions {
                    rank_percent: Some(0.0),
                    entity_mask: Some(&entity_mask),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(none.refined_mask.unwrap().min().double_value(&[]), 1.0);
        assert_eq!(none.out.abs().sum(Kind::Float).double_value(&[]), 0.0);
    }

    #[test]
    fn test_rank_keeps_top_fraction() {
        let vs = VarStore::new(Device::Cpu);
        let attn = layer(&vs, 4, 1);
        let opts = (Kind::Float, Device::Cpu);
        let entities = Tensor::randn([1, 4, 4], opts);
        let entity_mask = Tensor::zeros([1, 4], opts);
        let pre = Tensor::zeros([1, 1, 4], opts);
        let post = Tensor::zeros([1, 1], opts);

        let out = attn
            .forward_with(
                &entities,
                Some(&pre),
                &post,
                AttentionOptions {
                    rank_percent: Some(0.5),
                    entity_mask: Some(&entity_mask),
                    ..Default::default()
                },
            )
            .unwrap();
        let masked = out.refined_mask.unwrap().sum(Kind::Float).double_value(&[]);
        assert_eq!(masked, 2.0);
    }
}
