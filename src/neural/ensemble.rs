//! Ensemble of independently parameterized estimators.
//!
//! Each member owns its VarStore and Adam optimizer; no parameters are
//! shared. Training touches one member per step, evaluation averages all
//! of them.

use rand::{Rng, RngExt};
use serde::{Deserialize, Serialize};
use tch::nn::OptimizerConfig;
use tch::{nn, Device, Tensor};

use crate::neural::net::{Net, NetConfig, NetOutput};
use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleConfig {
    pub n_members: usize,
    /// Exclusive upper bound of the training-mode member draw. Defaults to
    /// `n_members - 1`, which never touches the last member; it only ever
    /// contributes to the evaluation average. Set to `n_members` to train
    /// every member.
    pub sample_upper: Option<usize>,
    pub learning_rate: f64,
    pub net: NetConfig,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            n_members: 5,
            sample_upper: None,
            learning_rate: 1e-4,
            net: NetConfig::default(),
        }
    }
}

struct Member {
    vs: nn::VarStore,
    net: Net,
    opt: nn::Optimizer,
}

pub struct Ensemble {
    members: Vec<Member>,
    sample_upper: usize,
}

impl Ensemble {
    pub fn new(cfg: &EnsembleConfig, device: Device) -> Result<Self> {
        if cfg.n_members == 0 {
            return Err(crate::TrainError::Config(
                "ensemble needs at least one member".to_string(),
            ));
        }
        if cfg.net.eps_variance_floor <= 0.0 {
            return Err(crate::TrainError::Config(
                "eps_variance_floor must be strictly positive".to_string(),
            ));
        }
        let sample_upper = cfg
            .sample_upper
            .unwrap_or(cfg.n_members.saturating_sub(1))
            .clamp(1, cfg.n_members);

        let mut members = Vec::with_capacity(cfg.n_members);
        for _ in 0..cfg.n_members {
            let vs = nn::VarStore::new(device);
            let net = Net::new(&vs.root(), &cfg.net);
            let opt = nn::Adam::default().build(&vs, cfg.learning_rate)?;
            members.push(Member { vs, net, opt });
        }
        log::info!(
            "🧠 Ensemble ready: {} member(s), training draw over [0, {})",
            cfg.n_members,
            sample_upper
        );
        Ok(Self {
            members,
            sample_upper,
        })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Training-mode member draw, uniform over `[0, sample_upper)`.
    pub fn sample_index(&self, rng: &mut impl Rng) -> usize {
        rng.random_range(0..self.sample_upper)
    }

    pub fn forward_member(&self, idx: usize, x: &Tensor, train: bool) -> NetOutput {
        self.members[idx].net.forward(x, train)
    }

    /// Evaluation mode: elementwise mean of every member's outputs.
    pub fn forward_eval(&self, x: &Tensor) -> NetOutput {
        let k = self.members.len() as f64;
        let first = self.members[0].net.forward(x, false);
        let (mut value, mut variance, mut policy) = (first.value, first.variance, first.policy);
        for m in &self.members[1..] {
            let out = m.net.forward(x, false);
            value = value + out.value;
            variance = variance + out.variance;
            policy = policy + out.policy;
        }
        NetOutput {
            value: value / k,
            variance: variance / k,
            policy: policy / k,
        }
    }

    pub fn var_store(&self, idx: usize) -> &nn::VarStore {
        &self.members[idx].vs
    }

    pub fn var_store_mut(&mut self, idx: usize) -> &mut nn::VarStore {
        &mut self.members[idx].vs
    }

    pub fn optimizer_mut(&mut self, idx: usize) -> &mut nn::Optimizer {
        &mut self.members[idx].opt
    }

    /// Forward through one member while its optimizer is borrowed, used by
    /// the per-example Fisher sweep.
    pub fn member_parts_mut(&mut self, idx: usize) -> (&nn::VarStore, &Net, &mut nn::Optimizer) {
        let m = &mut self.members[idx];
        (&m.vs, &m.net, &mut m.opt)
    }

    /// Apply a new learning rate to every member optimizer.
    pub fn set_lr(&mut self, lr: f64) {
        for m in &mut self.members {
            m.opt.set_lr(lr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    fn small_cfg(k: usize) -> EnsembleConfig {
        EnsembleConfig {
            n_members: k,
            net: NetConfig {
                input_shape: (8, 6),
                filters: 4,
                hidden: 8,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn eval_output_is_member_mean() {
        let ens = Ensemble::new(&small_cfg(2), Device::Cpu).unwrap();
        let x = Tensor::rand([3, 1, 8, 6], (Kind::Float, Device::Cpu));

        let a = ens.forward_member(0, &x, false);
        let b = ens.forward_member(1, &x, false);
        let avg = ens.forward_eval(&x);

        let expected = (&a.value + &b.value) / 2.0;
        let diff = (&avg.value - expected).abs().max().double_value(&[]);
        assert!(diff < 1e-6);

        let expected_var = (&a.variance + &b.variance) / 2.0;
        let diff = (&avg.variance - expected_var).abs().max().double_value(&[]);
        assert!(diff < 1e-6);
    }

    #[test]
    fn single_member_eval_is_identity() {
        let ens = Ensemble::new(&small_cfg(1), Device::Cpu).unwrap();
        let x = Tensor::rand([2, 1, 8, 6], (Kind::Float, Device::Cpu));
        let solo = ens.forward_member(0, &x, false);
        let avg = ens.forward_eval(&x);
        let diff = (&avg.value - &solo.value).abs().max().double_value(&[]);
        assert!(diff < 1e-6);
    }

    #[test]
    fn default_draw_excludes_last_member() {
        let ens = Ensemble::new(&small_cfg(5), Device::Cpu).unwrap();
        let mut rng = rand::rng();
        for _ in 0..200 {
            assert!(ens.sample_index(&mut rng) < 4);
        }
    }

    #[test]
    fn widened_draw_reaches_every_member() {
        let mut cfg = small_cfg(3);
        cfg.sample_upper = Some(3);
        let ens = Ensemble::new(&cfg, Device::Cpu).unwrap();
        let mut rng = rand::rng();
        let mut seen = [false; 3];
        for _ in 0..300 {
            seen[ens.sample_index(&mut rng)] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn zero_members_rejected() {
        assert!(Ensemble::new(&small_cfg(0), Device::Cpu).is_err());
    }
}
