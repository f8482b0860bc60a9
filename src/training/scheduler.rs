//! Plateau learning-rate scheduling fed by the pooled validation loss.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Multiplier applied to the learning rate on a plateau
    pub factor: f64,
    /// Validation passes without improvement before reducing
    pub patience: usize,
    pub min_lr: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            factor: 0.5,
            patience: 5,
            min_lr: 1e-6,
        }
    }
}

/// Reduce-on-plateau over the validation loss.
pub struct ReduceLrOnPlateau {
    cfg: SchedulerConfig,
    lr: f64,
    best: f64,
    stale: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(cfg: SchedulerConfig, initial_lr: f64) -> Self {
        Self {
            cfg,
            lr: initial_lr,
            best: f64::INFINITY,
            stale: 0,
        }
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    /// Feed one pooled validation loss; returns the new learning rate when
    /// a reduction fires.
    pub fn step(&mut self, val_loss: f64) -> Option<f64> {
        if val_loss < self.best {
            self.best = val_loss;
            self.stale = 0;
            return None;
        }
        self.stale += 1;
        if self.stale <= self.cfg.patience {
            return None;
        }
        self.stale = 0;
        let reduced = (self.lr * self.cfg.factor).max(self.cfg.min_lr);
        if reduced < self.lr {
            self.lr = reduced;
            Some(reduced)
        } else {
            None
        }
    }
}
