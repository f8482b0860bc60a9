//! # Tetris Value Trainer
//!
//! Continual-learning trainer for an ensemble of value/variance networks
//! evaluated on Tetris board states (22×10, single channel, 7 actions).
//!
//! ## Features
//!
//! - **Target construction**: Monte-Carlo returns or TD returns with an
//!   eligibility trace, built from raw self-play episode arrays
//! - **Heteroscedastic losses**: MAE/MSE, Gaussian KL-divergence and
//!   Gaussian negative log-likelihood formulations
//! - **Ensemble**: K independent networks, single-member training steps,
//!   averaged evaluation
//! - **EWC**: Fisher-information regularization against catastrophic
//!   forgetting across self-play data cycles
//! - **Persistence**: single-file safetensors checkpoints and portable
//!   export for a secondary inference runtime

// ============================================================================
// PUBLIC API MODULES
// ============================================================================

/// Episode arrays and training-target construction
pub mod data;

/// Value/variance network and ensemble
pub mod neural;

/// Loss engines, EWC, statistics and the training loop
pub mod training;

/// Checkpoint save/load (safetensors)
pub mod checkpoint;

/// Portable interchange export for the secondary runtime
pub mod export;

/// Trainer configuration surface
pub mod config;

/// Logging setup (flexi_logger)
pub mod logging;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Main error type for the trainer library
#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error("tensor error: {0}")]
    Tch(#[from] tch::TchError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("checkpoint format error: {0}")]
    SafeTensor(#[from] safetensors::tensor::SafeTensorError),

    #[error("loss history error: {0}")]
    Csv(#[from] csv::Error),

    #[error("no training data matched the configured patterns")]
    EmptyDataset,

    #[error("data shape error: {0}")]
    Data(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("portable export conversion failed (status {status}): {stderr}")]
    ExportConversion { status: String, stderr: String },
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, TrainError>;

// ============================================================================
// LIBRARY VERSION INFO
// ============================================================================

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
