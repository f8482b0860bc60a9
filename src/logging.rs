use flexi_logger::{Cleanup, Criterion, FileSpec, Logger, Naming, opt_format};

/// Initialize logging for a training process.
///
/// Level comes from `RUST_LOG` with an `info` fallback. When `log_dir` is
/// given, logs rotate on size and only the last few files are kept.
pub fn setup_logging(log_dir: Option<&str>) -> Result<(), flexi_logger::FlexiLoggerError> {
    let logger = Logger::try_with_env_or_str("info")?;
    match log_dir {
        Some(dir) => {
            logger
                .log_to_file(FileSpec::default().directory(dir))
                .format(opt_format)
                .rotate(
                    Criterion::Size(10 * 1024 * 1024),
                    Naming::Numbers,
                    Cleanup::KeepLogFiles(3),
                )
                .start()?;
        }
        None => {
            logger.start()?;
        }
    }
    Ok(())
}
