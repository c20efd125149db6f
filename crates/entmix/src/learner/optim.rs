//! RMSprop with global-norm gradient clipping.

use crate::config::LearnerConfig;
use crate::{EntmixError, Result};
use std::path::Path;
use tch::{Kind, Tensor};

const STEP_KEY: &str = "__step";

/// RMSprop over a fixed, named parameter list.
///
/// `square_avg = alpha * square_avg + (1 - alpha) * g^2`, then
/// `p -= lr * g / (sqrt(square_avg) + eps)`; weight decay is added to the
/// gradient first.
pub struct RmsProp {
    params: Vec<(String, Tensor)>,
    square_avg: Vec<Tensor>,
    lr: f64,
    alpha: f64,
    eps: f64,
    weight_decay: f64,
    steps: u64,
}

impl RmsProp {
    pub fn new(params: Vec<(String, Tensor)>, lr: f64, alpha: f64, eps: f64, weight_decay: f64) -> Self {
        let square_avg = params.iter().map(|(_, p)| p.zeros_like()).collect();
        Self {
            params,
            square_avg,
            lr,
            alpha,
            eps,
            weight_decay,
            steps: 0,
        }
    }

    pub fn from_config(params: Vec<(String, Tensor)>, cfg: &LearnerConfig) -> Self {
        Self::new(params, cfg.lr, cfg.optim_alpha, cfg.optim_eps, cfg.weight_decay)
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Parameters managed by this optimizer
    pub fn variables(&self) -> impl Iterator<Item = &Tensor> {
        self.params.iter().map(|(_, p)| p)
    }

    pub fn zero_grad(&mut self) {
        for (_, param) in self.params.iter_mut() {
            param.zero_grad();
        }
    }

    /// Scale gradients so their global L2 norm is at most `max_norm`.
    /// Returns the norm before clipping.
    pub fn clip_grad_norm(&mut self, max_norm: f64) -> f64 {
        let mut global_norm = 0.0f64;
        for (_, param) in &self.params {
            let grad = param.grad();
            if grad.defined() {
                global_norm += grad
                    .pow_tensor_scalar(2.0)
                    .sum(Kind::Float)
                    .double_value(&[]);
            }
        }
        global_norm = global_norm.sqrt();

        if global_norm > max_norm {
            let clip_coef = max_norm / (global_norm + 1e-6);
            for (_, param) in &self.params {
                let mut grad = param.grad();
                if grad.defined() {
                    let _ = grad.f_mul_scalar_(clip_coef);
                }
            }
        }
        global_norm
    }

    pub fn step(&mut self) {
        let (lr, alpha, eps, wd) = (self.lr, self.alpha, self.eps, self.weight_decay);
        tch::no_grad(|| {
            for ((_, param), square_avg) in self.params.iter_mut().zip(self.square_avg.iter_mut()) {
                let grad = param.grad();
                if !grad.defined() {
                    continue;
                }
                let grad = if wd != 0.0 { grad + &*param * wd } else { grad };
                let updated = &*square_avg * alpha + grad.pow_tensor_scalar(2.0) * (1.0 - alpha);
                square_avg.copy_(&updated);
                let delta = grad / (updated.sqrt() + eps) * lr;
                let next = &*param - delta;
                param.copy_(&next);
            }
        });
        self.steps += 1;
    }

    /// Save running averages and the step count
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let step = Tensor::from(self.steps as i64);
        let mut named: Vec<(&str, &Tensor)> = self
            .params
            .iter()
            .zip(self.square_avg.iter())
            .map(|((name, _), avg)| (name.as_str(), avg))
            .collect();
        named.push((STEP_KEY, &step));
        Tensor::save_multi(&named, path)?;
        Ok(())
    }

    /// Restore state written by [`save`](Self::save) for the same parameter names
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut saved: std::collections::HashMap<String, Tensor> =
            Tensor::load_multi(path)?.into_iter().collect();

        for ((name, param), avg) in self.params.iter().zip(self.square_avg.iter_mut()) {
            let value = saved.remove(name).ok_or_else(|| {
                EntmixError::Checkpoint(format!(
                    "{} has no optimizer state for `{}`",
                    path.display(),
                    name
                ))
            })?;
            if value.size() != param.size() {
                return Err(EntmixError::ShapeMismatch {
                    field: name.clone(),
                    expected: param.size(),
                    actual: value.size(),
                });
            }
            tch::no_grad(|| avg.copy_(&value.to_device(param.device())));
        }
        if let Some(step) = saved.remove(STEP_KEY) {
            self.steps = step.int64_value(&[]).max(0) as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn, Device};

    fn quadratic() -> (nn::VarStore, RmsProp) {
        let vs = nn::VarStore::new(Device::Cpu);
        let _w = vs.root().var("w", &[3], nn::Init::Const(1.0));
        let params = vs
            .variables()
            .into_iter()
            .collect::<Vec<_>>();
        let opt = RmsProp::new(params, 0.1, 0.99, 1e-5, 0.0);
        (vs, opt)
    }

    #[test]
    fn test_step_reduces_loss() {
        let (vs, mut opt) = quadratic();
        let w = vs.root().get("w").unwrap();
        let before = w.pow_tensor_scalar(2.0).sum(Kind::Float).double_value(&[]);

        for _ in 0..5 {
            opt.zero_grad();
            w.pow_tensor_scalar(2.0).sum(Kind::Float).backward();
            opt.step();
        }
        let after = w.pow_tensor_scalar(2.0).sum(Kind::Float).double_value(&[]);
        assert!(after < before);
        assert_eq!(opt.steps(), 5);
    }

    #[test]
    fn test_clip_grad_norm_reports_unclipped_norm() {
        let (vs, mut opt) = quadratic();
        let w = vs.root().get("w").unwrap();
        opt.zero_grad();
        // grad = 2w = [2, 2, 2], norm = sqrt(12)
        w.pow_tensor_scalar(2.0).sum(Kind::Float).backward();
        let norm = opt.clip_grad_norm(1.0);
        assert!((norm - 12f64.sqrt()).abs() < 1e-5);

        let clipped = w.grad().pow_tensor_scalar(2.0).sum(Kind::Float).double_value(&[]).sqrt();
        assert!((clipped - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_save_and_load_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opt.th");
        let (vs, mut opt) = quadratic();
        let w = vs.root().get("w").unwrap();
        opt.zero_grad();
        w.sum(Kind::Float).backward();
        opt.step();
        opt.save(&path).unwrap();

        let (_vs2, mut fresh) = quadratic();
        fresh.load(&path).unwrap();
        assert_eq!(fresh.steps(), 1);
        let diff = (&fresh.square_avg[0] - &opt.square_avg[0]).abs().sum(Kind::Float);
        assert_eq!(diff.double_value(&[]), 0.0);
    }
}
