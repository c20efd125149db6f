//! Layers shared by agents, mixers and the elector.

pub mod attention;
pub mod distribution;
pub mod pooling;

pub use attention::{AttentionOptions, AttentionOutput, EntityAttentionLayer, HeadReduce};
pub use distribution::Distribution;
pub use pooling::{EntityPoolingLayer, PoolingType};

use tch::{Kind, Tensor};

/// Pairwise mask from a per-entity mask: `[.., ne]` → `[.., ne, ne]`,
/// 1 where either entity of the pair is absent.
pub fn pair_mask(entity_mask: &Tensor) -> Tensor {
    let valid = 1.0f64 - entity_mask.to_kind(Kind::Float);
    1.0f64 - valid.unsqueeze(-1) * valid.unsqueeze(-2)
}

/// Sum of `values * weights` over every element divided by the weight mass
/// (0 when the mass is zero).
pub fn masked_mean(values: &Tensor, weights: &Tensor) -> Tensor {
    let mass = weights.sum(Kind::Float);
    (values * weights).sum(Kind::Float) / mass.clamp_min(1e-8)
}
