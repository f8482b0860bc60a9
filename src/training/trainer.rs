//! The training loop.
//!
//! Orchestrates minibatch sampling, single-member gradient steps with the
//! EWC penalty, periodic chunked validation with exact pooled statistics,
//! loss-history recording and end-of-run Fisher computation + checkpoint.

use std::path::PathBuf;

use rand::{Rng, RngExt};
use serde::{Deserialize, Serialize};
use tch::Device;

use crate::checkpoint::{self, CheckpointMeta, Loaded};
use crate::config::TrainerConfig;
use crate::data::targets::TargetBatch;
use crate::neural::ensemble::Ensemble;
use crate::training::ewc::{EwcRegularizer, FisherStrategy, SecondMomentTracker};
use crate::training::loss::LossEngine;
use crate::training::normalization::TargetNormalizer;
use crate::training::scheduler::ReduceLrOnPlateau;
use crate::training::stats::{pool, ChunkStats};
use crate::{Result, TrainError};

/// How the held-out validation split is selected.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SplitMode {
    /// A uniform random fraction of all examples
    RandomFraction(f64),
    /// Every step whose episode id is below the cutoff
    EpisodeThreshold(i64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    pub enabled: bool,
    pub mode: SplitMode,
    /// Hard cap on validation examples; negative means uncapped
    pub set_size_max: i64,
    /// Target number of validation passes over the whole run
    pub total: usize,
    pub chunk_size: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: SplitMode::RandomFraction(0.05),
            set_size_max: -1,
            total: 25,
            chunk_size: 1000,
        }
    }
}

/// Pooled validation-pass statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationStats {
    pub loss: f64,
    pub loss_std: f64,
    pub loss_v: f64,
    pub loss_var: f64,
    pub loss_p: f64,
}

/// Outcome of one training run.
#[derive(Debug)]
pub struct TrainReport {
    pub iters: i64,
    pub train_loss_ema: f64,
    pub validation: Option<ValidationStats>,
}

#[derive(Serialize)]
struct HistoryRow {
    iter: i64,
    loss: f64,
    loss_v: f64,
    loss_var: f64,
    loss_p: f64,
    loss_ewc: f64,
    val_loss: f64,
    val_loss_std: f64,
}

pub struct Trainer {
    cfg: TrainerConfig,
    device: Device,
    ensemble: Ensemble,
    loss: LossEngine,
    ewc: EwcRegularizer,
    trackers: Vec<SecondMomentTracker>,
    scheduler: Option<ReduceLrOnPlateau>,
    normalizer: Option<TargetNormalizer>,
}

impl Trainer {
    pub fn new(cfg: TrainerConfig) -> Result<Self> {
        cfg.validate()?;
        let device = if cfg.use_cuda {
            Device::cuda_if_available()
        } else {
            Device::Cpu
        };
        let ensemble = Ensemble::new(&cfg.ensemble, device)?;
        let k = ensemble.len();
        let loss = LossEngine::new(cfg.loss.clone());
        let ewc = EwcRegularizer::new(cfg.ewc_lambda, k);
        let trackers = (0..k)
            .map(|_| SecondMomentTracker::new(cfg.moment_decay))
            .collect();
        let scheduler = cfg
            .scheduler
            .clone()
            .map(|s| ReduceLrOnPlateau::new(s, cfg.ensemble.learning_rate));
        Ok(Self {
            cfg,
            device,
            ensemble,
            loss,
            ewc,
            trackers,
            scheduler,
            normalizer: None,
        })
    }

    pub fn ensemble(&self) -> &Ensemble {
        &self.ensemble
    }

    pub fn normalizer(&self) -> Option<&TargetNormalizer> {
        self.normalizer.as_ref()
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.cfg.model_dir.join(checkpoint::CHECKPOINT_FILE)
    }

    /// Restore from the configured checkpoint, if one exists.
    ///
    /// A missing file is the expected cycle-0 state and leaves the freshly
    /// initialized ensemble in place.
    pub fn load_checkpoint(&mut self) -> Result<Loaded> {
        let loaded = checkpoint::load(
            &self.checkpoint_path(),
            &mut self.ensemble,
            &mut self.trackers,
            &mut self.ewc,
        )?;
        if let Loaded::Restored(meta) = &loaded {
            self.normalizer = meta.normalizer.clone();
        }
        Ok(loaded)
    }

    /// Train over one cycle's worth of targets.
    pub fn run(&mut self, data: TargetBatch) -> Result<TrainReport> {
        let mut rng = rand::rng();

        let data = if self.cfg.shuffle {
            data.shuffle(&mut rng)
        } else {
            data
        };

        let (mut train, mut val) = split(&data, &self.cfg.validation, &mut rng);
        if train.is_empty() {
            return Err(TrainError::EmptyDataset);
        }
        drop(data);

        if self.cfg.target_normalization {
            let norm = TargetNormalizer::fit(&train);
            norm.apply(&mut train);
            if let Some(v) = val.as_mut() {
                norm.apply(v);
            }
            log::info!(
                "Target normalization: value ({:.3}, {:.3}), variance ({:.3}, {:.3})",
                norm.v_mean,
                norm.v_std,
                norm.var_mean,
                norm.var_std
            );
            self.normalizer = Some(norm);
        }

        let n_train = train.len();
        let iters = iteration_budget(
            self.cfg.epochs,
            n_train,
            self.cfg.batch_size,
            self.cfg.min_iters,
            self.cfg.max_iters,
        );
        let val_interval = iters / self.cfg.validation.total as i64 + 1;
        log::info!(
            "🏋️ Training: {} examples, {} iterations, validating every {}",
            n_train,
            iters,
            val_interval
        );

        let mut loss_ema = 0.0;
        let mut last_val: Option<ValidationStats> = None;
        let mut history: Vec<HistoryRow> = Vec::new();
        let mut last_terms = (0.0, 0.0, 0.0, 0.0); // loss_v/var/p/ewc diagnostics

        for i in 0..iters {
            let indices: Vec<i64> = (0..self.cfg.batch_size)
                .map(|_| rng.random_range(0..n_train as i64))
                .collect();
            let mb = to_device(&train.select(&indices), self.device);

            let member = self.ensemble.sample_index(&mut rng);
            let out = self.ensemble.forward_member(member, &mb.state, true);
            let terms = self.loss.compute(&out, &mb);
            let penalty = self.ewc.penalty(member, self.ensemble.var_store(member));
            let loss_ewc = penalty.double_value(&[]);
            let total = &terms.loss + penalty;
            let loss_val = total.double_value(&[]);

            self.ensemble.optimizer_mut(member).backward_step(&total);
            self.trackers[member].update(self.ensemble.var_store(member));

            loss_ema =
                self.cfg.loss_ema_decay * loss_ema + (1.0 - self.cfg.loss_ema_decay) * loss_val;
            last_terms = (terms.loss_v, terms.loss_var, terms.loss_p, loss_ewc);

            if i % val_interval == 0 {
                if let Some(v) = &val {
                    if let Some(stats) = self.validate(v) {
                        if let Some(sched) = self.scheduler.as_mut() {
                            if let Some(new_lr) = sched.step(stats.loss) {
                                log::info!("📉 Plateau: learning rate reduced to {new_lr:e}");
                                self.ensemble.set_lr(new_lr);
                            }
                        }
                        last_val = Some(stats);
                    }
                }
                log::info!(
                    "iter {}/{} loss {:.5} val {:.5}",
                    i,
                    iters,
                    loss_ema,
                    last_val.map(|v| v.loss).unwrap_or(0.0)
                );
            }

            if self.cfg.loss_history_path.is_some() && i % self.cfg.save_interval as i64 == 0 {
                let v = last_val.unwrap_or_default();
                history.push(HistoryRow {
                    iter: i,
                    loss: loss_val,
                    loss_v: last_terms.0,
                    loss_var: last_terms.1,
                    loss_p: last_terms.2,
                    loss_ewc: last_terms.3,
                    val_loss: v.loss,
                    val_loss_std: v.loss_std,
                });
            }
        }

        if self.cfg.ewc_enabled {
            self.refresh_fisher(&train)?;
        }

        std::fs::create_dir_all(&self.cfg.model_dir)?;
        let meta = CheckpointMeta {
            cycle: self.cfg.cycle,
            n_members: self.ensemble.len(),
            normalizer: self.normalizer.clone(),
            library_version: crate::VERSION.to_string(),
            config: Some(self.cfg.clone()),
        };
        checkpoint::save(
            &self.checkpoint_path(),
            &self.ensemble,
            &self.trackers,
            &self.ewc,
            &meta,
        )?;
        log::info!("💾 Checkpoint saved to {}", self.checkpoint_path().display());

        if let Some(path) = &self.cfg.loss_history_path {
            write_history(path, &history)?;
        }

        Ok(TrainReport {
            iters,
            train_loss_ema: loss_ema,
            validation: last_val,
        })
    }

    /// Chunked no-grad pass over the validation split with exact pooled
    /// statistics. `None` when the split is empty.
    fn validate(&self, val: &TargetBatch) -> Option<ValidationStats> {
        let n = val.len();
        if n == 0 {
            return None;
        }
        let chunk_size = self.cfg.validation.chunk_size.max(1) as i64;

        let mut chunks = Vec::new();
        let mut comps = (0.0, 0.0, 0.0);
        let mut start = 0i64;
        while start < n as i64 {
            let len = chunk_size.min(n as i64 - start);
            let b = to_device(&val.narrow(start, len), self.device);
            let (mean, std, lv, lvar, lp) = tch::no_grad(|| {
                let out = self.ensemble.forward_eval(&b.state);
                let terms = self.loss.compute(&out, &b);
                (
                    terms.loss.double_value(&[]),
                    terms.loss_std,
                    terms.loss_v,
                    terms.loss_var,
                    terms.loss_p,
                )
            });
            chunks.push(ChunkStats {
                len: len as usize,
                mean,
                std,
            });
            let w = len as f64 / n as f64;
            comps.0 += w * lv;
            comps.1 += w * lvar;
            comps.2 += w * lp;
            start += len;
        }

        let (loss, loss_std) = pool(&chunks)?;
        Some(ValidationStats {
            loss,
            loss_std,
            loss_v: comps.0,
            loss_var: comps.1,
            loss_p: comps.2,
        })
    }

    /// End-of-cycle Fisher estimation for every member, then snapshot.
    fn refresh_fisher(&mut self, train: &TargetBatch) -> Result<()> {
        let strategy = self.cfg.fisher_strategy;
        log::info!(
            "🧮 Estimating Fisher information ({:?}) over {} examples",
            strategy,
            train.len()
        );
        for m in 0..self.ensemble.len() {
            let fisher = match strategy {
                FisherStrategy::AdamMoments => self.trackers[m].as_fisher(),
                FisherStrategy::Explicit => {
                    let (vs, net, opt) = self.ensemble.member_parts_mut(m);
                    self.ewc.explicit_fisher(m, vs, net, opt, &self.loss, train)
                }
            };
            self.ewc.install(m, fisher, self.ensemble.var_store(m));
        }
        Ok(())
    }
}

fn write_history(path: &std::path::Path, rows: &[HistoryRow]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// `epochs · (n / batch)` clamped into `[min_iters, max_iters]`; negative
/// bounds leave that side open.
fn iteration_budget(epochs: usize, n: usize, batch: usize, min_iters: i64, max_iters: i64) -> i64 {
    let mut iters = (epochs * (n / batch)) as i64;
    if max_iters >= 0 {
        iters = iters.min(max_iters);
    }
    if min_iters >= 0 {
        iters = iters.max(min_iters);
    }
    iters
}

fn to_device(batch: &TargetBatch, device: Device) -> TargetBatch {
    TargetBatch {
        state: batch.state.to_device(device),
        value: batch.value.to_device(device),
        variance: batch.variance.to_device(device),
        policy: batch.policy.to_device(device),
        weight: batch.weight.to_device(device),
        episode: batch.episode.clone(),
    }
}

/// Carve the dataset into train and validation splits.
fn split(
    data: &TargetBatch,
    cfg: &ValidationConfig,
    rng: &mut impl Rng,
) -> (TargetBatch, Option<TargetBatch>) {
    if !cfg.enabled {
        return (data.select(&all_indices(data.len())), None);
    }
    let n = data.len();
    let mut val_idx: Vec<i64> = match cfg.mode {
        SplitMode::RandomFraction(f) => {
            if f <= 0.0 {
                Vec::new()
            } else if f >= 1.0 {
                all_indices(n)
            } else {
                let n_val = (n as f64 * f) as usize;
                rand::seq::index::sample(rng, n, n_val.min(n))
                    .into_iter()
                    .map(|i| i as i64)
                    .collect()
            }
        }
        SplitMode::EpisodeThreshold(cutoff) => (0..n as i64)
            .filter(|&i| data.episode[i as usize] < cutoff)
            .collect(),
    };

    if cfg.set_size_max >= 0 && val_idx.len() > cfg.set_size_max as usize {
        let keep = rand::seq::index::sample(rng, val_idx.len(), cfg.set_size_max as usize);
        val_idx = keep.into_iter().map(|i| val_idx[i]).collect();
    }

    let in_val: std::collections::HashSet<i64> = val_idx.iter().copied().collect();
    let train_idx: Vec<i64> = (0..n as i64).filter(|i| !in_val.contains(i)).collect();

    let val = if val_idx.is_empty() {
        None
    } else {
        val_idx.sort_unstable();
        Some(data.select(&val_idx))
    };
    (data.select(&train_idx), val)
}

fn all_indices(n: usize) -> Vec<i64> {
    (0..n as i64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Kind, Tensor};

    fn synthetic_batch(n: usize, episodes_of: usize) -> TargetBatch {
        let values: Vec<f32> = (0..n).map(|i| i as f32).collect();
        TargetBatch {
            state: Tensor::rand([n as i64, 1, 8, 6], (Kind::Float, Device::Cpu)),
            value: Tensor::from_slice(&values).view([n as i64, 1]),
            variance: Tensor::ones([n as i64, 1], (Kind::Float, Device::Cpu)) * 2.0,
            policy: Tensor::full([n as i64, 7], 1.0 / 7.0, (Kind::Float, Device::Cpu)),
            weight: Tensor::ones([n as i64, 1], (Kind::Float, Device::Cpu)),
            episode: (0..n).map(|i| (i / episodes_of) as i64).collect(),
        }
    }

    #[test]
    fn iteration_budget_respects_clamps() {
        assert_eq!(iteration_budget(10, 320, 32, -1, -1), 100);
        assert_eq!(iteration_budget(10, 320, 32, 2000, -1), 2000);
        assert_eq!(iteration_budget(10, 320, 32, -1, 50), 50);
        // min is applied last, so it wins over max
        assert_eq!(iteration_budget(10, 320, 32, 2000, 50), 2000);
    }

    #[test]
    fn random_split_sizes_add_up() {
        let data = synthetic_batch(100, 10);
        let cfg = ValidationConfig {
            enabled: true,
            mode: SplitMode::RandomFraction(0.2),
            ..Default::default()
        };
        let mut rng = rand::rng();
        let (train, val) = split(&data, &cfg, &mut rng);
        let val = val.unwrap();
        assert_eq!(train.len() + val.len(), 100);
        assert_eq!(val.len(), 20);
    }

    #[test]
    fn episodic_split_pulls_early_episodes() {
        let data = synthetic_batch(30, 10); // episodes 0, 1, 2
        let cfg = ValidationConfig {
            enabled: true,
            mode: SplitMode::EpisodeThreshold(1),
            ..Default::default()
        };
        let mut rng = rand::rng();
        let (train, val) = split(&data, &cfg, &mut rng);
        let val = val.unwrap();
        assert_eq!(val.len(), 10);
        assert!(val.episode.iter().all(|&e| e < 1));
        assert!(train.episode.iter().all(|&e| e >= 1));
    }

    #[test]
    fn validation_cap_limits_split_size() {
        let data = synthetic_batch(100, 10);
        let cfg = ValidationConfig {
            enabled: true,
            mode: SplitMode::RandomFraction(0.5),
            set_size_max: 7,
            ..Default::default()
        };
        let mut rng = rand::rng();
        let (train, val) = split(&data, &cfg, &mut rng);
        assert_eq!(val.unwrap().len(), 7);
        assert_eq!(train.len(), 50);
    }

    #[test]
    fn zero_fraction_means_no_validation() {
        let data = synthetic_batch(10, 5);
        let cfg = ValidationConfig {
            enabled: true,
            mode: SplitMode::RandomFraction(0.0),
            ..Default::default()
        };
        let mut rng = rand::rng();
        let (train, val) = split(&data, &cfg, &mut rng);
        assert!(val.is_none());
        assert_eq!(train.len(), 10);
    }

    fn tiny_trainer(tmp: &std::path::Path) -> Trainer {
        let mut cfg = TrainerConfig::default();
        cfg.ensemble.n_members = 2;
        cfg.ensemble.sample_upper = Some(2);
        cfg.ensemble.net.input_shape = (8, 6);
        cfg.ensemble.net.filters = 4;
        cfg.ensemble.net.hidden = 8;
        cfg.batch_size = 4;
        cfg.epochs = 1;
        cfg.min_iters = 3;
        cfg.max_iters = 3;
        cfg.model_dir = tmp.to_path_buf();
        Trainer::new(cfg).unwrap()
    }

    #[test]
    fn empty_validation_split_is_skipped() {
        let dir = std::env::temp_dir().join("tvt_no_val");
        let trainer = tiny_trainer(&dir);
        let empty = synthetic_batch(0, 1);
        assert!(trainer.validate(&empty).is_none());
    }

    #[test]
    fn validate_pools_across_chunk_boundaries() {
        let dir = std::env::temp_dir().join("tvt_chunks");
        let mut trainer = tiny_trainer(&dir);
        trainer.cfg.validation.chunk_size = 3;
        let data = synthetic_batch(10, 5);

        let pooled = trainer.validate(&data).unwrap();
        trainer.cfg.validation.chunk_size = 1000;
        let single = trainer.validate(&data).unwrap();
        assert!((pooled.loss - single.loss).abs() < 1e-6);
        assert!((pooled.loss_std - single.loss_std).abs() < 1e-5);
    }
}
