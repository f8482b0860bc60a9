use clap::Parser;
use std::path::PathBuf;

use tetris_value_trainer::config::TrainerConfig;
use tetris_value_trainer::data::episode::load_episode_sets;
use tetris_value_trainer::data::targets::{TargetComputer, TargetMode, WeightMode};
use tetris_value_trainer::export::PortableExporter;
use tetris_value_trainer::logging::setup_logging;
use tetris_value_trainer::training::ewc::FisherStrategy;
use tetris_value_trainer::training::loss::LossKind;
use tetris_value_trainer::training::scheduler::SchedulerConfig;
use tetris_value_trainer::training::trainer::{SplitMode, Trainer, ValidationConfig};

#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Eq)]
enum LossCli {
    Mae,
    Mse,
    Kldiv,
    Mle,
}

impl From<LossCli> for LossKind {
    fn from(cli: LossCli) -> Self {
        match cli {
            LossCli::Mae => LossKind::Mae,
            LossCli::Mse => LossKind::Mse,
            LossCli::Kldiv => LossKind::KlDiv,
            LossCli::Mle => LossKind::Mle,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Eq)]
enum FisherCli {
    /// Reuse the tracked second moments of the gradients
    Adam,
    /// Exact per-example squared-gradient average
    Explicit,
}

impl From<FisherCli> for FisherStrategy {
    fn from(cli: FisherCli) -> Self {
        match cli {
            FisherCli::Adam => FisherStrategy::AdamMoments,
            FisherCli::Explicit => FisherStrategy::Explicit,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "tetris_value_trainer")]
struct Args {
    /// Glob patterns of self-play dump prefixes
    #[arg(long, num_args = 0..)]
    data_paths: Vec<String>,

    /// Use only the most recent n dumps (-1 for all)
    #[arg(long, default_value_t = 1)]
    last_nfiles: i64,

    #[arg(long, default_value_t = 32)]
    batch_size: usize,

    /// Self-play cycle number, recorded in the checkpoint
    #[arg(long, default_value_t = -1)]
    cycle: i64,

    /// Bootstrap value targets from child statistics instead of
    /// Monte-Carlo returns
    #[arg(long, default_value_t = false)]
    td: bool,

    /// Blend future bootstrap returns with geometric decay (needs --td)
    #[arg(long, default_value_t = false)]
    eligibility_trace: bool,

    #[arg(long, default_value_t = 0.9)]
    eligibility_trace_lambda: f64,

    #[arg(long, default_value_t = 10)]
    epochs: usize,

    /// Minimum training iterations (negative for no minimum)
    #[arg(long, default_value_t = 2000)]
    min_iters: i64,

    /// Maximum training iterations (negative for unlimited)
    #[arg(long, default_value_t = -1)]
    max_iters: i64,

    /// Start from a fresh ensemble instead of the checkpoint
    #[arg(long, default_value_t = false)]
    new: bool,

    /// Elastic weight consolidation against the previous cycle
    #[arg(long, default_value_t = false)]
    ewc: bool,

    #[arg(long, default_value_t = 1.0)]
    ewc_lambda: f64,

    #[arg(long, value_enum, default_value = "explicit")]
    fisher: FisherCli,

    #[arg(long, value_enum, default_value = "kldiv")]
    loss: LossCli,

    /// Hold out a validation set
    #[arg(long, default_value_t = false)]
    validation: bool,

    /// Validation mode (0: random fraction, 1: episodic)
    #[arg(long, default_value_t = 0)]
    val_mode: u8,

    /// Fraction of examples held out in random mode
    #[arg(long, default_value_t = 0.05)]
    val_set_size: f64,

    /// Episodes held out in episodic mode
    #[arg(long, default_value_t = 0)]
    val_episodes: i64,

    /// Maximum validation examples (negative for unlimited)
    #[arg(long, default_value_t = -1)]
    val_set_size_max: i64,

    /// Number of validation passes over the run
    #[arg(long, default_value_t = 25)]
    val_total: usize,

    /// Write the loss history CSV
    #[arg(long, default_value_t = false)]
    save_loss: bool,

    #[arg(long, default_value_t = 100)]
    save_interval: usize,

    #[arg(long, default_value = "loss_history.csv")]
    loss_path: PathBuf,

    #[arg(long, default_value_t = false)]
    shuffle: bool,

    /// Standardize value and variance targets over the training split
    #[arg(long, default_value_t = false)]
    target_normalization: bool,

    /// Weight per-example losses (needs --td without trace)
    #[arg(long, default_value_t = false)]
    weighted_mse: bool,

    /// 0: inverse variance, 1: visit count, 2: visits over variance
    #[arg(long, default_value_t = 0)]
    weighted_mse_mode: u8,

    /// Reduce the learning rate when validation loss plateaus
    #[arg(long, default_value_t = false)]
    lr_schedule: bool,

    #[arg(long, default_value_t = 5)]
    n_members: usize,

    #[arg(long, default_value_t = 1e-4)]
    learning_rate: f64,

    #[arg(long, default_value = "model_checkpoints")]
    model_dir: PathBuf,

    /// Export a portable copy of the trained ensemble here
    #[arg(long)]
    export_dir: Option<PathBuf>,

    /// External conversion command run on the exported weights;
    /// `{}` expands to the weights path
    #[arg(long, num_args = 1..)]
    converter: Option<Vec<String>>,

    /// Directory for rotating log files (stderr only when unset)
    #[arg(long)]
    log_dir: Option<String>,

    #[arg(long, default_value_t = false)]
    use_cuda: bool,
}

fn target_mode(args: &Args) -> TargetMode {
    if args.td && args.eligibility_trace {
        return TargetMode::TdTrace {
            lambda: args.eligibility_trace_lambda,
        };
    }
    if args.td {
        let weighting = if !args.weighted_mse {
            WeightMode::Uniform
        } else {
            match args.weighted_mse_mode {
                0 => WeightMode::InverseVariance,
                1 => WeightMode::VisitCount,
                _ => WeightMode::VisitOverVariance,
            }
        };
        return TargetMode::Td { weighting };
    }
    TargetMode::MonteCarlo
}

fn validation_config(args: &Args) -> ValidationConfig {
    let mode = if args.val_mode == 1 {
        // episode ids are compared strictly, so holding out n episodes
        // means a cutoff one past the last held-out id
        SplitMode::EpisodeThreshold(args.val_episodes + 1)
    } else {
        SplitMode::RandomFraction(args.val_set_size)
    };
    let enabled = args.validation
        && match mode {
            SplitMode::EpisodeThreshold(_) => args.val_episodes > 0,
            SplitMode::RandomFraction(f) => f > 0.0,
        };
    ValidationConfig {
        enabled,
        mode,
        set_size_max: args.val_set_size_max,
        total: args.val_total.max(1),
        ..Default::default()
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    setup_logging(args.log_dir.as_deref())?;

    let mut cfg = TrainerConfig {
        target_mode: target_mode(&args),
        batch_size: args.batch_size,
        epochs: args.epochs,
        min_iters: args.min_iters,
        max_iters: args.max_iters,
        validation: validation_config(&args),
        target_normalization: args.target_normalization,
        shuffle: args.shuffle,
        ewc_enabled: args.ewc,
        ewc_lambda: args.ewc_lambda,
        fisher_strategy: args.fisher.clone().into(),
        scheduler: args.lr_schedule.then(SchedulerConfig::default),
        loss_history_path: args.save_loss.then(|| args.loss_path.clone()),
        save_interval: args.save_interval,
        model_dir: args.model_dir.clone(),
        cycle: args.cycle,
        use_cuda: args.use_cuda,
        ..Default::default()
    };
    cfg.ensemble.n_members = args.n_members;
    cfg.ensemble.learning_rate = args.learning_rate;
    cfg.loss.kind = args.loss.clone().into();
    cfg.loss.weighted = args.weighted_mse && args.td && !args.eligibility_trace;

    let (h, w) = cfg.ensemble.net.input_shape;
    let episodes = load_episode_sets(
        &args.data_paths,
        args.last_nfiles,
        h,
        w,
        cfg.ensemble.net.n_actions,
    )?;
    log::info!("🧩 Loaded {} board states", episodes.len());

    let targets = TargetComputer::new(cfg.target_mode).compute(&episodes)?;

    let mut trainer = Trainer::new(cfg)?;
    if !args.new {
        trainer.load_checkpoint()?;
    }

    let report = trainer.run(targets)?;
    log::info!(
        "✅ Training done: {} iterations, loss EMA {:.5}",
        report.iters,
        report.train_loss_ema
    );
    if let Some(val) = &report.validation {
        log::info!(
            "Validation: loss {:.5} ± {:.5} (v {:.5}, var {:.5}, p {:.5})",
            val.loss,
            val.loss_std,
            val.loss_v,
            val.loss_var,
            val.loss_p
        );
    }

    if let Some(export_dir) = &args.export_dir {
        let exporter = PortableExporter::new(export_dir, args.converter.clone());
        exporter.export(trainer.ensemble(), (h, w), trainer.normalizer())?;
    }

    Ok(())
}
