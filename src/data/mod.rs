//! Self-play episode arrays and training-target construction.

pub mod episode;
pub mod targets;

pub use episode::EpisodeSet;
pub use targets::{TargetBatch, TargetComputer, TargetMode, WeightMode};
