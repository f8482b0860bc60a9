//! Integration tests for the library public API

use tetris_value_trainer::config::TrainerConfig;
use tetris_value_trainer::neural::net::NetConfig;
use tetris_value_trainer::{Result, TrainError, NAME, VERSION};

#[test]
fn test_library_metadata() {
    assert!(!VERSION.is_empty());
    assert_eq!(NAME, "tetris_value_trainer");
}

#[test]
fn test_error_types() {
    let data_error = TrainError::Data("ragged columns".to_string());
    assert!(matches!(data_error, TrainError::Data(_)));

    let config_error = TrainError::Config("bad lambda".to_string());
    assert!(matches!(config_error, TrainError::Config(_)));

    let empty = TrainError::EmptyDataset;
    assert!(matches!(empty, TrainError::EmptyDataset));
}

#[test]
fn test_result_type_alias() {
    let success: Result<i32> = Ok(42);
    assert!(success.is_ok());
    assert_eq!(success.unwrap(), 42);

    let failure: Result<i32> = Err(TrainError::EmptyDataset);
    assert!(failure.is_err());
}

#[test]
fn test_default_board_geometry() {
    let net = NetConfig::default();
    assert_eq!(net.input_shape, (22, 10));
    assert_eq!(net.n_actions, 7);
}

#[test]
fn test_default_config_is_valid() {
    let cfg = TrainerConfig::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.batch_size, 32);
    assert_eq!(cfg.ensemble.n_members, 5);
}
