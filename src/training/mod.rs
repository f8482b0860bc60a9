//! Loss formulations, EWC regularization, streaming statistics and the
//! training loop itself.

pub mod ewc;
pub mod loss;
pub mod normalization;
pub mod scheduler;
pub mod stats;
pub mod trainer;

pub use ewc::{EwcRegularizer, FisherStrategy, SecondMomentTracker};
pub use loss::{LossConfig, LossEngine, LossKind, LossTerms};
pub use normalization::TargetNormalizer;
pub use scheduler::{ReduceLrOnPlateau, SchedulerConfig};
pub use stats::{pool, ChunkStats};
pub use trainer::{SplitMode, TrainReport, Trainer, ValidationConfig};
