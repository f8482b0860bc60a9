//! End-to-end training cycles on synthetic data: run, checkpoint, restore.

use assert_matches::assert_matches;
use tch::{Device, Kind, Tensor};

use tetris_value_trainer::checkpoint::Loaded;
use tetris_value_trainer::config::TrainerConfig;
use tetris_value_trainer::data::targets::TargetBatch;
use tetris_value_trainer::training::ewc::FisherStrategy;
use tetris_value_trainer::training::trainer::{SplitMode, Trainer, ValidationConfig};

const H: i64 = 8;
const W: i64 = 6;

fn synthetic_targets(n: i64) -> TargetBatch {
    let values: Vec<f32> = (0..n).map(|i| (i % 30) as f32).collect();
    TargetBatch {
        state: Tensor::rand([n, 1, H, W], (Kind::Float, Device::Cpu)),
        value: Tensor::from_slice(&values).view([n, 1]),
        variance: Tensor::ones([n, 1], (Kind::Float, Device::Cpu)) * 4.0,
        policy: Tensor::full([n, 7], 1.0 / 7.0, (Kind::Float, Device::Cpu)),
        weight: Tensor::ones([n, 1], (Kind::Float, Device::Cpu)),
        episode: (0..n).map(|i| i / 10).collect(),
    }
}

fn tiny_config(model_dir: &std::path::Path) -> TrainerConfig {
    let mut cfg = TrainerConfig::default();
    cfg.ensemble.n_members = 2;
    cfg.ensemble.sample_upper = Some(2);
    cfg.ensemble.net.input_shape = (H, W);
    cfg.ensemble.net.filters = 4;
    cfg.ensemble.net.hidden = 8;
    cfg.batch_size = 4;
    cfg.epochs = 1;
    cfg.min_iters = 6;
    cfg.max_iters = 6;
    cfg.cycle = 3;
    cfg.model_dir = model_dir.to_path_buf();
    cfg
}

#[test]
fn training_run_writes_a_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let mut trainer = Trainer::new(tiny_config(dir.path())).unwrap();
    let report = trainer.run(synthetic_targets(40)).unwrap();

    assert_eq!(report.iters, 6);
    assert!(report.train_loss_ema.is_finite());
    assert!(trainer.checkpoint_path().exists());
}

#[test]
fn missing_checkpoint_starts_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let mut trainer = Trainer::new(tiny_config(dir.path())).unwrap();
    assert_matches!(trainer.load_checkpoint().unwrap(), Loaded::Fresh);
}

#[test]
fn checkpoint_roundtrip_restores_the_ensemble() {
    let dir = tempfile::tempdir().unwrap();
    let probe = Tensor::rand([1, 1, H, W], (Kind::Float, Device::Cpu));

    let mut first = Trainer::new(tiny_config(dir.path())).unwrap();
    first.run(synthetic_targets(40)).unwrap();
    let trained = tch::no_grad(|| first.ensemble().forward_eval(&probe));

    // A second trainer initializes randomly, then restores the saved state.
    let mut second = Trainer::new(tiny_config(dir.path())).unwrap();
    let loaded = second.load_checkpoint().unwrap();
    assert_matches!(loaded, Loaded::Restored(meta) => {
        assert_eq!(meta.cycle, 3);
        assert_eq!(meta.n_members, 2);
    });

    let restored = tch::no_grad(|| second.ensemble().forward_eval(&probe));
    assert!(trained.value.allclose(&restored.value, 1e-5, 1e-5, false));
    assert!(trained
        .variance
        .allclose(&restored.variance, 1e-5, 1e-5, false));
}

#[test]
fn member_count_mismatch_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut first = Trainer::new(tiny_config(dir.path())).unwrap();
    first.run(synthetic_targets(40)).unwrap();

    let mut cfg = tiny_config(dir.path());
    cfg.ensemble.n_members = 3;
    cfg.ensemble.sample_upper = Some(3);
    let mut second = Trainer::new(cfg).unwrap();
    assert!(second.load_checkpoint().is_err());
}

#[test]
fn validation_and_scheduler_run_through() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = tiny_config(dir.path());
    cfg.validation = ValidationConfig {
        enabled: true,
        mode: SplitMode::RandomFraction(0.25),
        set_size_max: -1,
        total: 3,
        chunk_size: 4,
    };
    cfg.scheduler = Some(Default::default());

    let mut trainer = Trainer::new(cfg).unwrap();
    let report = trainer.run(synthetic_targets(40)).unwrap();
    let val = report.validation.unwrap();
    assert!(val.loss.is_finite());
    assert!(val.loss_std >= 0.0);
}

#[test]
fn ewc_cycle_persists_fisher_across_restore() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = tiny_config(dir.path());
    cfg.ewc_enabled = true;
    cfg.fisher_strategy = FisherStrategy::AdamMoments;

    let mut first = Trainer::new(cfg.clone()).unwrap();
    first.run(synthetic_targets(40)).unwrap();

    // The follow-up cycle restores the Fisher and keeps training.
    let mut second = Trainer::new(cfg).unwrap();
    assert_matches!(second.load_checkpoint().unwrap(), Loaded::Restored(_));
    let report = second.run(synthetic_targets(40)).unwrap();
    assert!(report.train_loss_ema.is_finite());
}

#[test]
fn normalizer_travels_with_the_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = tiny_config(dir.path());
    cfg.target_normalization = true;

    let mut first = Trainer::new(cfg.clone()).unwrap();
    first.run(synthetic_targets(40)).unwrap();
    let fitted = first.normalizer().cloned().unwrap();

    let mut second = Trainer::new(cfg).unwrap();
    second.load_checkpoint().unwrap();
    assert_eq!(second.normalizer(), Some(&fitted));
}

#[test]
fn loss_history_is_written() {
    let dir = tempfile::tempdir().unwrap();
    let csv_path = dir.path().join("loss.csv");
    let mut cfg = tiny_config(dir.path());
    cfg.loss_history_path = Some(csv_path.clone());
    cfg.save_interval = 2;

    let mut trainer = Trainer::new(cfg).unwrap();
    trainer.run(synthetic_targets(40)).unwrap();

    let contents = std::fs::read_to_string(&csv_path).unwrap();
    let mut lines = contents.lines();
    assert_eq!(
        lines.next().unwrap(),
        "iter,loss,loss_v,loss_var,loss_p,loss_ewc,val_loss,val_loss_std"
    );
    // 6 iterations recorded every 2nd one: iters 0, 2, 4
    assert_eq!(lines.count(), 3);
}
