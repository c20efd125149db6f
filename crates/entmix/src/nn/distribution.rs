//! Probability distributions used by message encoders and the elector.

use tch::{Kind, Tensor};

const LOG_2PI: f64 = 1.837_877_066_409_345_5;

/// Enum for the distribution families produced by the agents
pub enum Distribution {
    Categorical { logits: Tensor },
    Gaussian { mean: Tensor, std: Tensor },
}

impl Distribution {
    /// Diagonal Gaussian
    pub fn gaussian(mean: Tensor, std: Tensor) -> Self {
        Self::Gaussian { mean, std }
    }

    pub fn categorical(logits: Tensor) -> Self {
        Self::Categorical { logits }
    }

    /// Draw a sample. Gaussian samples are reparameterized.
    pub fn sample(&self) -> Tensor {
        match self {
            Self::Categorical { logits } => logits
                .softmax(-1, Kind::Float)
                .multinomial(1, true)
                .squeeze_dim(-1),
            Self::Gaussian { mean, std } => mean + Tensor::randn_like(mean) * std,
        }
    }

    /// Element-wise log density for Gaussians (sum the last axis yourself),
    /// log probability of indices for categoricals.
    pub fn log_prob(&self, value: &Tensor) -> Tensor {
        match self {
            Self::Categorical { logits } => {
                let log_probs = logits.log_softmax(-1, Kind::Float);
                let indices = if value.dim() == log_probs.dim() {
                    value.to_kind(Kind::Int64)
                } else {
                    value.unsqueeze(-1).to_kind(Kind::Int64)
                };
                log_probs.gather(-1, &indices, false).squeeze_dim(-1)
            }
            Self::Gaussian { mean, std } => {
                let var = std.pow_tensor_scalar(2.0);
                let sq_diff = (value - mean).pow_tensor_scalar(2.0);
                (sq_diff / var + std.log() * 2.0 + LOG_2PI) * -0.5
            }
        }
    }

    /// Element-wise entropy for Gaussians, per-row entropy for categoricals
    pub fn entropy(&self) -> Tensor {
        match self {
            Self::Categorical { logits } => {
                let probs = logits.softmax(-1, Kind::Float);
                let log_probs = logits.log_softmax(-1, Kind::Float);
                -(probs * log_probs).sum_dim_intlist([-1i64].as_slice(), false, Kind::Float)
            }
            Self::Gaussian { std, .. } => std.log() + 0.5 + 0.5 * LOG_2PI,
        }
    }

    /// Element-wise `KL(self || other)` between diagonal Gaussians
    pub fn kl(&self, other: &Distribution) -> Option<Tensor> {
        match (self, other) {
            (
                Self::Gaussian { mean: m1, std: s1 },
                Self::Gaussian { mean: m2, std: s2 },
            ) => {
                let var_ratio = (s1 / s2).pow_tensor_scalar(2.0);
                let t1 = ((m1 - m2) / s2).pow_tensor_scalar(2.0);
                Some((var_ratio + t1 - 1.0 - (s1 / s2).log() * 2.0) * 0.5)
            }
            (Self::Categorical { logits: l1 }, Self::Categorical { logits: l2 }) => {
                let p = l1.softmax(-1, Kind::Float);
                let diff = l1.log_softmax(-1, Kind::Float) - l2.log_softmax(-1, Kind::Float);
                Some((p * diff).sum_dim_intlist([-1i64].as_slice(), false, Kind::Float))
            }
            _ => None,
        }
    }

    pub fn mean(&self) -> Tensor {
        match self {
            Self::Categorical { logits } => logits.argmax(-1, false),
            Self::Gaussian { mean, .. } => mean.shallow_clone(),
        }
    }

    /// Variance for Gaussians
    pub fn variance(&self) -> Option<Tensor> {
        match self {
            Self::Gaussian { std, .. } => Some(std.pow_tensor_scalar(2.0)),
            Self::Categorical { .. } => None,
        }
    }

    /// Rearrange the parameters of a Gaussian with `f` (e.g. slicing or a
    /// transpose); categoricals are rearranged on their logits.
    pub fn map(&self, f: impl Fn(&Tensor) -> Tensor) -> Self {
        match self {
            Self::Categorical { logits } => Self::Categorical { logits: f(logits) },
            Self::Gaussian { mean, std } => Self::Gaussian {
                mean: f(mean),
                std: f(std),
            },
        }
    }
}
