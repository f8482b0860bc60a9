//! Trainer configuration surface.
//!
//! Everything the core consumes, in one place. The CLI builds one of
//! these; nothing in the library reads ambient state or module-level
//! globals (export paths included).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::data::targets::TargetMode;
use crate::neural::ensemble::EnsembleConfig;
use crate::training::ewc::FisherStrategy;
use crate::training::loss::LossConfig;
use crate::training::scheduler::SchedulerConfig;
use crate::training::trainer::ValidationConfig;
use crate::{Result, TrainError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    pub ensemble: EnsembleConfig,
    pub loss: LossConfig,
    pub target_mode: TargetMode,

    pub batch_size: usize,
    pub epochs: usize,
    /// Lower iteration clamp; negative means unbounded below
    pub min_iters: i64,
    /// Upper iteration clamp; negative means unbounded above
    pub max_iters: i64,
    /// Decay of the training-loss moving average used for monitoring
    pub loss_ema_decay: f64,

    pub validation: ValidationConfig,
    pub target_normalization: bool,
    /// Shuffle the assembled dataset once before splitting
    pub shuffle: bool,

    pub ewc_enabled: bool,
    pub ewc_lambda: f64,
    pub fisher_strategy: FisherStrategy,
    /// Decay of the tracked gradient second moments (Adam's default)
    pub moment_decay: f64,

    pub scheduler: Option<SchedulerConfig>,
    /// Accepted for CLI compatibility but never consulted by the loop;
    /// no stopping rule is implemented
    pub early_stopping_patience: Option<usize>,

    /// CSV loss-history destination, written when set
    pub loss_history_path: Option<PathBuf>,
    /// Iterations between loss-history rows
    pub save_interval: usize,

    /// Directory holding the checkpoint file
    pub model_dir: PathBuf,
    /// Data cycle index, recorded in the checkpoint metadata
    pub cycle: i64,
    pub use_cuda: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            ensemble: EnsembleConfig::default(),
            loss: LossConfig::default(),
            target_mode: TargetMode::MonteCarlo,
            batch_size: 32,
            epochs: 10,
            min_iters: 2000,
            max_iters: -1,
            loss_ema_decay: 0.99,
            validation: ValidationConfig::default(),
            target_normalization: false,
            shuffle: false,
            ewc_enabled: false,
            ewc_lambda: 1.0,
            fisher_strategy: FisherStrategy::Explicit,
            moment_decay: 0.999,
            scheduler: None,
            early_stopping_patience: None,
            loss_history_path: None,
            save_interval: 100,
            model_dir: PathBuf::from("model_checkpoints"),
            cycle: -1,
            use_cuda: false,
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(TrainError::Config("batch_size must be positive".into()));
        }
        if self.ensemble.n_members == 0 {
            return Err(TrainError::Config("ensemble must have members".into()));
        }
        if self.ensemble.net.eps_variance_floor <= 0.0 {
            return Err(TrainError::Config(
                "eps_variance_floor must be strictly positive".into(),
            ));
        }
        if let TargetMode::TdTrace { lambda } = self.target_mode {
            if !(0.0..1.0).contains(&lambda) || lambda == 0.0 {
                return Err(TrainError::Config(format!(
                    "eligibility trace lambda must lie in (0, 1), got {lambda}"
                )));
            }
        }
        if !(0.0..1.0).contains(&self.loss_ema_decay) {
            return Err(TrainError::Config(
                "loss_ema_decay must lie in [0, 1)".into(),
            ));
        }
        if self.validation.total == 0 {
            return Err(TrainError::Config(
                "validation.total must be positive".into(),
            ));
        }
        Ok(())
    }
}
