//! Logger setup for applications embedding the filters.
//!
//! The library itself only emits records through the `log` facade. Applications call
//! [`init_logger`] once at startup to route them to stderr or a file.

use std::error::Error;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use log::LevelFilter;

use crate::config::LoggingConfig;

/// Initialize the global logger.
///
/// Lines are formatted as `YYYY-mm-dd HH:MM:SS.mmm [LEVEL] - message` in local time.
///
/// # Arguments
/// * `level` - Most verbose level that is emitted
/// * `log_file` - Optional path to log file (logs to stderr if None). Missing parent
///   directories are created and the file is appended to.
///
/// # Errors
/// Returns an error if the log file cannot be opened or a global logger is already installed.
pub fn init_logger(level: LevelFilter, log_file: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    });

    if let Some(log_path) = log_file {
        if let Some(parent) = log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let target = Box::new(OpenOptions::new().create(true).append(true).open(log_path)?);
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.try_init()?;
    Ok(())
}

/// Initialize the global logger from the `logging` section of a filter configuration.
pub fn init_from_config(config: &LoggingConfig) -> Result<(), Box<dyn Error>> {
    init_logger(config.level, config.file.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_target_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("trn.log");
        // The global logger may already be installed; the file is opened before that check.
        let _ = init_logger(LevelFilter::Info, Some(&path));
        assert!(path.exists());
    }

    #[test]
    fn configured_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            level: LevelFilter::Debug,
            file: Some(dir.path().join("nested").join("nav.log")),
        };
        let _ = init_from_config(&config);
        assert!(dir.path().join("nested").join("nav.log").exists());
    }

    #[test]
    fn unwritable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened for appending.
        assert!(init_logger(LevelFilter::Warn, Some(dir.path())).is_err());
    }
}
