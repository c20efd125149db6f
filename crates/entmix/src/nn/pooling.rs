//! Masked max/mean pooling with the attention layer's contract.

use serde::{Deserialize, Serialize};
use tch::{nn, nn::Module, Kind, Tensor};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolingType {
    Max,
    Mean,
}

#[derive(Debug)]
pub struct EntityPoolingLayer {
    in_trans: nn::Linear,
    out_trans: nn::Linear,
    pooling: PoolingType,
}

impl EntityPoolingLayer {
    pub fn new(
        path: nn::Path,
        in_dim: i64,
        embed_dim: i64,
        out_dim: i64,
        pooling: PoolingType,
    ) -> Self {
        Self {
            in_trans: nn::linear(&path / "in_trans", in_dim, embed_dim, Default::default()),
            out_trans: nn::linear(&path / "out_trans", embed_dim, out_dim, Default::default()),
            pooling,
        }
    }

    /// `entities [bs, ne, in_dim]`, `pre_mask [bs, >=nq, ne]`,
    /// `post_mask [bs, nq]` → `[bs, nq, out_dim]`.
    ///
    /// Masked entities contribute 0 to the pool, so a fully masked max pool
    /// yields 0.
    pub fn forward(&self, entities: &Tensor, pre_mask: Option<&Tensor>, post_mask: &Tensor) -> Tensor {
        let size = entities.size();
        let (bs, ne) = (size[0], size[1]);
        let nq = post_mask.size()[1];

        let projected = self.in_trans.forward(entities);
        let ed = projected.size()[2];
        let mut per_query = projected.reshape([bs, 1, ne, ed]).repeat([1, nq, 1, 1]);
        if let Some(mask) = pre_mask {
            let mask = mask.narrow(1, 0, nq).narrow(2, 0, ne).gt(0.5).unsqueeze(3);
            per_query = per_query.masked_fill(&mask, 0.0);
        }

        let pooled = match self.pooling {
            PoolingType::Max => per_query.max_dim(2, false).0,
            PoolingType::Mean => per_query.mean_dim(Some(&[2i64][..]), false, Kind::Float),
        };

        self.out_trans
            .forward(&pooled)
            .masked_fill(&post_mask.gt(0.5).unsqueeze(2), 0.0)
    }
}
