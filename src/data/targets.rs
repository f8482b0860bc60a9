//! Training-target construction from raw episode arrays.
//!
//! Three return estimators are available: plain Monte-Carlo returns,
//! one-step bootstrap (TD) values, and TD blended over a trailing window
//! with an eligibility trace. Episodes are independent, so the per-episode
//! work is spread across rayon workers.

use rand::RngExt;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tch::Tensor;

use crate::data::episode::EpisodeSet;
use crate::Result;

/// Epsilon added to variances before inversion in the weighting modes.
pub const WEIGHT_EPS: f32 = 1e-3;

/// Which return estimator builds the value targets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TargetMode {
    /// `value[i] = final_score - score[i]` over each episode
    MonteCarlo,
    /// Bootstrap value from child visit statistics, with optional
    /// per-example weighting
    Td { weighting: WeightMode },
    /// Geometrically decayed blend of future bootstrap returns within the
    /// episode, `lambda` in (0, 1)
    TdTrace { lambda: f64 },
}

/// Per-example weighting applied in [`TargetMode::Td`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeightMode {
    /// Every example weighs 1
    Uniform,
    /// `1 / (variance + eps)`
    InverseVariance,
    /// Total child visits, normalized to mean 1
    VisitCount,
    /// Visit-count weight (normalized first) divided by `variance + eps`
    VisitOverVariance,
}

/// Five index-aligned tensors ready for minibatch sampling, plus the
/// retained episode ids for episodic validation splits.
pub struct TargetBatch {
    /// `(N, 1, H, W)`
    pub state: Tensor,
    /// `(N, 1)`
    pub value: Tensor,
    /// `(N, 1)`
    pub variance: Tensor,
    /// `(N, A)`
    pub policy: Tensor,
    /// `(N, 1)`, non-negative
    pub weight: Tensor,
    /// Episode id per example
    pub episode: Vec<i64>,
}

impl TargetBatch {
    pub fn len(&self) -> usize {
        self.episode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.episode.is_empty()
    }

    /// Gather the examples at `indices` (repeats allowed) into a new batch.
    pub fn select(&self, indices: &[i64]) -> TargetBatch {
        let idx = Tensor::from_slice(indices);
        TargetBatch {
            state: self.state.index_select(0, &idx),
            value: self.value.index_select(0, &idx),
            variance: self.variance.index_select(0, &idx),
            policy: self.policy.index_select(0, &idx),
            weight: self.weight.index_select(0, &idx),
            episode: indices.iter().map(|&i| self.episode[i as usize]).collect(),
        }
    }

    /// Contiguous sub-batch `[start, start+len)`, used for validation chunks.
    pub fn narrow(&self, start: i64, len: i64) -> TargetBatch {
        TargetBatch {
            state: self.state.narrow(0, start, len),
            value: self.value.narrow(0, start, len),
            variance: self.variance.narrow(0, start, len),
            policy: self.policy.narrow(0, start, len),
            weight: self.weight.narrow(0, start, len),
            episode: self.episode[start as usize..(start + len) as usize].to_vec(),
        }
    }

    /// Reorder the whole batch by a random permutation.
    pub fn shuffle(&self, rng: &mut impl rand::Rng) -> TargetBatch {
        let mut perm: Vec<i64> = (0..self.len() as i64).collect();
        for i in (1..perm.len()).rev() {
            perm.swap(i, rng.random_range(0..=i));
        }
        self.select(&perm)
    }
}

/// Converts raw episode records into `(value, variance, weight)` targets.
pub struct TargetComputer {
    mode: TargetMode,
}

impl TargetComputer {
    pub fn new(mode: TargetMode) -> Self {
        Self { mode }
    }

    pub fn compute(&self, set: &EpisodeSet) -> Result<TargetBatch> {
        let n = set.len();
        let ranges = episode_ranges(&set.episode);

        let (values, weights) = match self.mode {
            TargetMode::MonteCarlo => (monte_carlo_values(set, &ranges), vec![1.0f32; n]),
            TargetMode::TdTrace { lambda } => {
                let v = bootstrap_values(set);
                (trace_values(set, &ranges, &v, lambda as f32), vec![1.0; n])
            }
            TargetMode::Td { weighting } => {
                let v = bootstrap_values(set);
                let w = td_weights(set, weighting);
                (v, w)
            }
        };

        let h = set.height;
        let w = set.width;
        let a = set.n_actions;
        Ok(TargetBatch {
            state: Tensor::from_slice(&set.boards).view([n as i64, 1, h, w]),
            value: Tensor::from_slice(&values).view([n as i64, 1]),
            variance: Tensor::from_slice(&set.variance).view([n as i64, 1]),
            policy: Tensor::from_slice(&set.policy).view([n as i64, a]),
            weight: Tensor::from_slice(&weights).view([n as i64, 1]),
            episode: set.episode.clone(),
        })
    }
}

/// Contiguous `[start, end)` index range of each episode.
fn episode_ranges(episode: &[i64]) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut start = 0;
    for i in 1..=episode.len() {
        if i == episode.len() || episode[i] != episode[start] {
            ranges.push((start, i));
            start = i;
        }
    }
    ranges
}

fn monte_carlo_values(set: &EpisodeSet, ranges: &[(usize, usize)]) -> Vec<f32> {
    let segments: Vec<Vec<f32>> = ranges
        .par_iter()
        .map(|&(start, end)| {
            let final_score = set.score[end - 1];
            set.score[start..end]
                .iter()
                .map(|s| final_score - s)
                .collect()
        })
        .collect();
    segments.concat()
}

/// Visit-weighted mean of the child value estimates, `Σ n·q / Σ n`.
///
/// A step with no recorded visits contributes a zero bootstrap instead of
/// propagating NaN downstream.
fn bootstrap_values(set: &EpisodeSet) -> Vec<f32> {
    let a = set.n_actions as usize;
    (0..set.len())
        .map(|i| {
            let visits = &set.visits[i * a..(i + 1) * a];
            let q = &set.q_values[i * a..(i + 1) * a];
            let total: f32 = visits.iter().sum();
            if total > 0.0 {
                visits.iter().zip(q).map(|(n, q)| n * q).sum::<f32>() / total
            } else {
                0.0
            }
        })
        .collect()
}

/// Eligibility-trace blend over the remaining steps of each episode.
///
/// The `r = i` term always contributes weight 1, so the weight sum is
/// strictly positive even for a single-step episode. Such an episode
/// degenerates to `score[i] + v[i] - score[i] = v[i]`, and terminal steps
/// carry no child visits, so the zero-visit bootstrap makes it exactly 0.
fn trace_values(
    set: &EpisodeSet,
    ranges: &[(usize, usize)],
    bootstrap: &[f32],
    lambda: f32,
) -> Vec<f32> {
    let segments: Vec<Vec<f32>> = ranges
        .par_iter()
        .map(|&(start, end)| {
            (start..end)
                .map(|i| {
                    let mut decay = 1.0f32;
                    let mut sum = 0.0f32;
                    let mut weight_sum = 0.0f32;
                    for r in i..end {
                        sum += decay * (set.score[r] + bootstrap[r] - set.score[i]);
                        weight_sum += decay;
                        decay *= lambda;
                    }
                    sum / weight_sum
                })
                .collect()
        })
        .collect();
    segments.concat()
}

fn td_weights(set: &EpisodeSet, mode: WeightMode) -> Vec<f32> {
    let n = set.len();
    let a = set.n_actions as usize;
    let visit_totals = || -> Vec<f32> {
        let totals: Vec<f32> = (0..n)
            .map(|i| set.visits[i * a..(i + 1) * a].iter().sum())
            .collect();
        let mean = totals.iter().sum::<f32>() / n as f32;
        totals.iter().map(|t| t / mean).collect()
    };
    match mode {
        WeightMode::Uniform => vec![1.0; n],
        WeightMode::InverseVariance => set
            .variance
            .iter()
            .map(|v| 1.0 / (v + WEIGHT_EPS))
            .collect(),
        WeightMode::VisitCount => visit_totals(),
        WeightMode::VisitOverVariance => visit_totals()
            .iter()
            .zip(&set.variance)
            .map(|(w, v)| w / (v + WEIGHT_EPS))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_with(
        score: Vec<f32>,
        episode: Vec<i64>,
        visits: Vec<f32>,
        q_values: Vec<f32>,
        variance: Vec<f32>,
    ) -> EpisodeSet {
        let n = score.len();
        let a = 2usize;
        EpisodeSet::from_columns(
            vec![0.0; n * 4],
            score,
            episode,
            visits,
            q_values,
            variance,
            vec![0.5; n * a],
            2,
            2,
            a as i64,
        )
        .unwrap()
    }

    #[test]
    fn monte_carlo_targets_subtract_running_score() {
        // Two episodes of 3 steps: scores [0,1,3] and [0,2,2]
        let set = set_with(
            vec![0.0, 1.0, 3.0, 0.0, 2.0, 2.0],
            vec![0, 0, 0, 1, 1, 1],
            vec![1.0; 12],
            vec![0.0; 12],
            vec![1.0; 6],
        );
        let batch = TargetComputer::new(TargetMode::MonteCarlo)
            .compute(&set)
            .unwrap();
        let values = Vec::<f32>::try_from(&batch.value.flatten(0, -1)).unwrap();
        assert_eq!(values, vec![3.0, 2.0, 0.0, 2.0, 0.0, 0.0]);
        let weights = Vec::<f32>::try_from(&batch.weight.flatten(0, -1)).unwrap();
        assert!(weights.iter().all(|&w| w == 1.0));
    }

    #[test]
    fn single_step_episode_trace_target_is_zero() {
        // One episode, one step: the look-ahead window is just r = i, and
        // with a zero bootstrap the blended sum cancels to 0 for any lambda.
        for lambda in [0.1, 0.5, 0.9, 0.99] {
            let set = set_with(
                vec![5.0],
                vec![0],
                vec![0.0, 0.0], // no visits -> zero bootstrap
                vec![3.0, 3.0],
                vec![1.0],
            );
            let batch = TargetComputer::new(TargetMode::TdTrace { lambda })
                .compute(&set)
                .unwrap();
            let values = Vec::<f32>::try_from(&batch.value.flatten(0, -1)).unwrap();
            assert_eq!(values, vec![0.0]);
        }
    }

    #[test]
    fn trace_blends_decayed_future_returns() {
        // One episode: scores [0, 2], uniform visits with q = 1 so the
        // bootstrap is 1 everywhere. For step 0 with lambda = 0.5:
        // terms (0 + 1 - 0) and 0.5 * (2 + 1 - 0), weight sum 1.5.
        let set = set_with(
            vec![0.0, 2.0],
            vec![0, 0],
            vec![1.0, 1.0, 1.0, 1.0],
            vec![1.0, 1.0, 1.0, 1.0],
            vec![1.0, 1.0],
        );
        let batch = TargetComputer::new(TargetMode::TdTrace { lambda: 0.5 })
            .compute(&set)
            .unwrap();
        let values = Vec::<f32>::try_from(&batch.value.flatten(0, -1)).unwrap();
        assert!((values[0] - (1.0 + 0.5 * 3.0) / 1.5).abs() < 1e-6);
        // Last step: single term (2 + 1 - 2) = 1
        assert!((values[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn inverse_variance_weights_are_exact_reciprocals() {
        let set = set_with(
            vec![0.0, 0.0, 0.0],
            vec![0, 0, 0],
            vec![1.0; 6],
            vec![0.0; 6],
            vec![1.0, 3.0, 0.0],
        );
        let batch = TargetComputer::new(TargetMode::Td {
            weighting: WeightMode::InverseVariance,
        })
        .compute(&set)
        .unwrap();
        let weights = Vec::<f32>::try_from(&batch.weight.flatten(0, -1)).unwrap();
        assert!((weights[0] - 1.0 / 1.001).abs() < 1e-6);
        assert!((weights[1] - 1.0 / 3.001).abs() < 1e-6);
        assert!((weights[2] - 1.0 / 0.001).abs() < 1e-2);
    }

    #[test]
    fn visit_weights_normalize_to_mean_one() {
        let set = set_with(
            vec![0.0, 0.0],
            vec![0, 0],
            vec![1.0, 1.0, 3.0, 3.0], // totals 2 and 6
            vec![0.0; 4],
            vec![1.0, 1.0],
        );
        let batch = TargetComputer::new(TargetMode::Td {
            weighting: WeightMode::VisitCount,
        })
        .compute(&set)
        .unwrap();
        let weights = Vec::<f32>::try_from(&batch.weight.flatten(0, -1)).unwrap();
        assert!((weights[0] - 0.5).abs() < 1e-6);
        assert!((weights[1] - 1.5).abs() < 1e-6);
    }

    #[test]
    fn td_targets_use_visit_weighted_bootstrap() {
        let set = set_with(
            vec![0.0],
            vec![0],
            vec![3.0, 1.0],
            vec![2.0, 6.0],
            vec![1.0],
        );
        let batch = TargetComputer::new(TargetMode::Td {
            weighting: WeightMode::Uniform,
        })
        .compute(&set)
        .unwrap();
        let values = Vec::<f32>::try_from(&batch.value.flatten(0, -1)).unwrap();
        // (3*2 + 1*6) / 4 = 3
        assert!((values[0] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn select_and_narrow_stay_aligned() {
        let set = set_with(
            vec![0.0, 1.0, 3.0],
            vec![0, 0, 0],
            vec![1.0; 6],
            vec![0.0; 6],
            vec![1.0; 3],
        );
        let batch = TargetComputer::new(TargetMode::MonteCarlo)
            .compute(&set)
            .unwrap();
        let picked = batch.select(&[2, 0]);
        assert_eq!(picked.len(), 2);
        let values = Vec::<f32>::try_from(&picked.value.flatten(0, -1)).unwrap();
        assert_eq!(values, vec![0.0, 3.0]);
        let chunk = batch.narrow(1, 2);
        assert_eq!(chunk.len(), 2);
        assert_eq!(chunk.episode, vec![0, 0]);
    }
}
