//! Per-example loss formulations.
//!
//! The loss family is picked once at construction; the hot loop never
//! dispatches on strings. `Mae`/`Mse` treat value and variance as separate
//! regression targets, `KlDiv` and `Mle` treat prediction and target as
//! Gaussians.

use serde::{Deserialize, Serialize};
use tch::{Kind, Reduction, Tensor};

use crate::neural::net::NetOutput;
use crate::data::targets::TargetBatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossKind {
    Mae,
    Mse,
    /// KL divergence between target Gaussian N(v, var) and predicted
    /// Gaussian N(v̂, v̂ar)
    KlDiv,
    /// Weighted Gaussian negative log-likelihood
    Mle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossConfig {
    pub kind: LossKind,
    pub learn_variance: bool,
    pub learn_policy: bool,
    pub weighted: bool,
    /// Floor applied to the target variance before any division
    pub variance_clip: f64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            kind: LossKind::KlDiv,
            learn_variance: true,
            learn_policy: false,
            weighted: false,
            variance_clip: 1.0,
        }
    }
}

/// Scalar loss components of one batch. Only `loss` carries gradients;
/// the rest are diagnostics.
pub struct LossTerms {
    pub loss: Tensor,
    pub loss_v: f64,
    pub loss_var: f64,
    pub loss_p: f64,
    /// Per-batch standard deviation of the per-example loss (KlDiv/Mle
    /// only; the pooled validation statistics need it)
    pub loss_std: f64,
}

pub struct LossEngine {
    cfg: LossConfig,
}

impl LossEngine {
    pub fn new(cfg: LossConfig) -> Self {
        Self { cfg }
    }

    pub fn kind(&self) -> LossKind {
        self.cfg.kind
    }

    pub fn compute(&self, out: &NetOutput, batch: &TargetBatch) -> LossTerms {
        let value = &batch.value;
        let variance = batch.variance.clamp_min(self.cfg.variance_clip);
        let weight = &batch.weight;

        match self.cfg.kind {
            LossKind::KlDiv => {
                let per_example = out.variance.log()
                    + (&variance + (value - &out.value).square()) / &out.variance
                    - variance.log()
                    - 1.0;
                Self::mean_std_terms(per_example)
            }
            LossKind::Mle => {
                let nll = out.variance.log()
                    + (&variance + (value - &out.value).square()) / &out.variance;
                Self::mean_std_terms(weight * nll)
            }
            kind => {
                let elem = |a: &Tensor, b: &Tensor| -> Tensor {
                    match kind {
                        LossKind::Mae => (a - b).abs(),
                        _ => (a - b).square(),
                    }
                };
                let device = out.value.device();

                let mut loss_v = elem(&out.value, value);
                let mut loss_var = if self.cfg.learn_variance {
                    elem(&out.variance, &variance)
                } else {
                    Tensor::zeros([], (Kind::Float, device))
                };
                if self.cfg.weighted {
                    loss_v = weight * loss_v;
                    loss_var = weight * loss_var;
                }
                let loss_v = loss_v.mean(Kind::Float);
                let loss_var = loss_var.mean(Kind::Float);

                let loss_p = if self.cfg.learn_policy {
                    out.policy
                        .log()
                        .kl_div(&batch.policy, Reduction::Mean, false)
                } else {
                    Tensor::zeros([], (Kind::Float, device))
                };

                let loss = &loss_v + &loss_var + &loss_p;
                LossTerms {
                    loss_v: loss_v.double_value(&[]),
                    loss_var: loss_var.double_value(&[]),
                    loss_p: loss_p.double_value(&[]),
                    loss_std: 0.0,
                    loss,
                }
            }
        }
    }

    fn mean_std_terms(per_example: Tensor) -> LossTerms {
        // Sample std; a single-element batch has none
        let loss_std = if per_example.numel() > 1 {
            per_example.std(true).double_value(&[])
        } else {
            0.0
        };
        LossTerms {
            loss: per_example.mean(Kind::Float),
            loss_v: 0.0,
            loss_var: 0.0,
            loss_p: 0.0,
            loss_std,
        }
    }
}
