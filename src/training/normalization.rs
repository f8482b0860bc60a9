//! Target standardization.
//!
//! Value and variance targets are standardized independently with
//! statistics computed on the training split only; the same affine is
//! applied to the validation split and the parameters travel with the
//! checkpoint so inference can invert the transform.

use serde::{Deserialize, Serialize};
use tch::Kind;

use crate::data::targets::TargetBatch;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetNormalizer {
    pub v_mean: f64,
    pub v_std: f64,
    pub var_mean: f64,
    pub var_std: f64,
}

/// Standard deviations this small turn the transform into an identity on
/// that column.
const MIN_STD: f64 = 1e-8;

impl TargetNormalizer {
    /// Fit on the training split (population statistics, matching the
    /// target arrays' provenance).
    pub fn fit(train: &TargetBatch) -> Self {
        let v_mean = train.value.mean(Kind::Float).double_value(&[]);
        let v_std = train.value.std(false).double_value(&[]);
        let var_mean = train.variance.mean(Kind::Float).double_value(&[]);
        let var_std = train.variance.std(false).double_value(&[]);
        Self {
            v_mean,
            v_std: if v_std < MIN_STD { 1.0 } else { v_std },
            var_mean,
            var_std: if var_std < MIN_STD { 1.0 } else { var_std },
        }
    }

    /// Standardize a batch's value/variance targets in place.
    pub fn apply(&self, batch: &mut TargetBatch) {
        batch.value = (&batch.value - self.v_mean) / self.v_std;
        batch.variance = (&batch.variance - self.var_mean) / self.var_std;
    }

    /// Map a normalized value prediction back to the target scale.
    pub fn denormalize_value(&self, v: f64) -> f64 {
        v * self.v_std + self.v_mean
    }

    /// Map a normalized variance prediction back to the target scale.
    pub fn denormalize_variance(&self, var: f64) -> f64 {
        var * self.var_std + self.var_mean
    }
}
