//! Elastic Weight Consolidation.
//!
//! A Fisher-information diagonal estimated at the end of a cycle marks
//! which parameters mattered for it; the next cycle pays a quadratic
//! penalty for moving them. Fisher estimate and reference snapshot are
//! kept in one struct so one can never be used without the other.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tch::{nn, Kind, Tensor};

use crate::data::targets::TargetBatch;
use crate::neural::net::Net;
use crate::training::loss::LossEngine;

/// How the Fisher diagonal is estimated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FisherStrategy {
    /// Reuse the tracked second moment of the gradients (what Adam keeps
    /// internally). Cheap, biased.
    AdamMoments,
    /// One backward pass per training example, accumulating squared
    /// gradients. Exact diagonal empirical Fisher; the dominant cost of a
    /// cycle when EWC is enabled.
    Explicit,
}

/// Fisher diagonal plus the parameter snapshot it was estimated around,
/// both keyed by VarStore variable name.
pub struct FisherEstimate {
    fisher: HashMap<String, Tensor>,
    snapshot: HashMap<String, Tensor>,
}

/// Detached copies of every variable, keyed by name.
pub fn snapshot_params(vs: &nn::VarStore) -> HashMap<String, Tensor> {
    vs.variables()
        .iter()
        .map(|(name, t)| (name.clone(), t.detach().copy()))
        .collect()
}

pub struct EwcRegularizer {
    lambda: f64,
    members: Vec<Option<FisherEstimate>>,
}

impl EwcRegularizer {
    pub fn new(lambda: f64, n_members: usize) -> Self {
        Self {
            lambda,
            members: (0..n_members).map(|_| None).collect(),
        }
    }

    pub fn has_fisher(&self, member: usize) -> bool {
        self.members[member].is_some()
    }

    /// Install a freshly estimated Fisher for `member`, snapshotting the
    /// current parameters as the reference point.
    pub fn install(&mut self, member: usize, fisher: HashMap<String, Tensor>, vs: &nn::VarStore) {
        self.members[member] = Some(FisherEstimate {
            fisher,
            snapshot: snapshot_params(vs),
        });
    }

    pub fn clear(&mut self, member: usize) {
        self.members[member] = None;
    }

    /// Quadratic drift penalty `0.5·λ·Σ F·(θ−θ0)²` for one member.
    ///
    /// Identically a zero scalar when no Fisher is installed — the defined
    /// "first cycle, nothing to preserve yet" state.
    pub fn penalty(&self, member: usize, vs: &nn::VarStore) -> Tensor {
        let zero = Tensor::zeros([], (Kind::Float, vs.device()));
        let Some(estimate) = &self.members[member] else {
            return zero;
        };
        let mut penalty = zero;
        for (name, param) in vs.variables() {
            if let (Some(fisher), Some(theta0)) =
                (estimate.fisher.get(&name), estimate.snapshot.get(&name))
            {
                let drift = (&param - theta0).square();
                penalty = penalty + (fisher * drift).sum(Kind::Float) * (0.5 * self.lambda);
            }
        }
        penalty
    }

    /// Per-member Fisher tensors, for checkpointing.
    pub fn fisher_tensors(&self, member: usize) -> Option<&HashMap<String, Tensor>> {
        self.members[member].as_ref().map(|e| &e.fisher)
    }

    /// Exact diagonal empirical Fisher over `batch` for one member.
    ///
    /// Each per-example loss includes the member's current EWC penalty
    /// before the backward pass.
    pub fn explicit_fisher(
        &self,
        member: usize,
        vs: &nn::VarStore,
        net: &Net,
        opt: &mut nn::Optimizer,
        engine: &LossEngine,
        batch: &TargetBatch,
    ) -> HashMap<String, Tensor> {
        let n = batch.len();
        let mut fisher: HashMap<String, Tensor> = vs
            .variables()
            .iter()
            .map(|(name, t)| {
                (
                    name.clone(),
                    Tensor::zeros(t.size(), (Kind::Float, vs.device())),
                )
            })
            .collect();

        for i in 0..n as i64 {
            opt.zero_grad();
            let example = batch.narrow(i, 1);
            let out = net.forward(&example.state.to_device(vs.device()), true);
            let loss = engine.compute(&out, &example).loss + self.penalty(member, vs);
            loss.backward();

            for (name, param) in vs.variables() {
                let grad = param.grad();
                if grad.defined() {
                    if let Some(acc) = fisher.get_mut(&name) {
                        *acc += grad.square() / n as f64;
                    }
                }
            }
        }
        opt.zero_grad();
        fisher
    }
}

/// Exponential moving average of squared gradients, maintained by the
/// trainer after each backward pass.
///
/// tch does not expose the C++ Adam's `exp_avg_sq` buffers, so the cheap
/// Fisher strategy reads this tracker instead; it is the same quantity
/// Adam tracks, with the same default decay.
pub struct SecondMomentTracker {
    decay: f64,
    moments: HashMap<String, Tensor>,
}

impl SecondMomentTracker {
    pub fn new(decay: f64) -> Self {
        Self {
            decay,
            moments: HashMap::new(),
        }
    }

    /// Fold in the gradients currently stored on the variables.
    pub fn update(&mut self, vs: &nn::VarStore) {
        for (name, param) in vs.variables() {
            let grad = param.grad();
            if !grad.defined() {
                continue;
            }
            let sq = grad.square().detach();
            match self.moments.entry(name) {
                Entry::Occupied(mut slot) => {
                    let m = slot.get_mut();
                    *m = (&*m * self.decay) + sq * (1.0 - self.decay);
                }
                Entry::Vacant(slot) => {
                    slot.insert(sq * (1.0 - self.decay));
                }
            }
        }
    }

    /// Copies of the tracked moments, usable as a Fisher estimate.
    pub fn as_fisher(&self) -> HashMap<String, Tensor> {
        self.moments
            .iter()
            .map(|(name, t)| (name.clone(), t.copy()))
            .collect()
    }

    pub fn tensors(&self) -> &HashMap<String, Tensor> {
        &self.moments
    }

    /// Replace the tracked state wholesale (checkpoint restore).
    pub fn restore(&mut self, moments: HashMap<String, Tensor>) {
        self.moments = moments;
    }

    pub fn is_empty(&self) -> bool {
        self.moments.is_empty()
    }
}
