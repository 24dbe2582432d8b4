//!
//! Provides centralized logging configuration with:
//! - Console (stderr) and daily-rolling file output
//! - Periodic cleanup of old logs
//! - Per-user log storage in `<data dir>/logs/`
//!

use anyhow::Result;
use chrono::{Duration, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::constants::{DEFAULT_LOG_RETENTION_DAYS, LOG_DIR_NAME, LOG_FILE_NAME};

/// Get the log directory path for a given data directory
pub fn get_log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(LOG_DIR_NAME)
}

/// Initialize the logger.
///
/// Installs a console layer on stderr (stdout is reserved for program
/// output) plus a daily-rolling file layer under `<data_dir>/logs/`.
/// `RUST_LOG` overrides `log_level` when set. With `quiet`, only the file
/// layer is installed.
pub fn init_logger(data_dir: &Path, log_level: &str, quiet: bool) -> Result<PathBuf> {
    let log_dir = get_log_dir(data_dir);
    fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, LOG_FILE_NAME);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        // Keep noisy model-runtime internals at warn
        EnvFilter::new(format!("recall={log_level},fastembed=warn,ort=warn,hf_hub=warn"))
    });

    let subscriber = tracing_subscriber::registry().with(env_filter);

    if quiet {
        let file_layer = fmt::layer()
            .with_writer(file_appender)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false);
        subscriber.with(file_layer).try_init()?;
    } else {
        let file_layer = fmt::layer()
            .with_writer(file_appender)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false);
        subscriber
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false),
            )
            .with(file_layer)
            .try_init()?;
    }

    tracing::info!("Logger initialized: level={}, log_dir={:?}", log_level, log_dir);
    Ok(log_dir)
}

/// Remove log files older than the retention period
pub fn cleanup_old_logs(log_dir: &Path, retention_days: i64) -> Result<()> {
    if !log_dir.exists() {
        return Ok(());
    }

    let cutoff_time = Utc::now() - Duration::days(retention_days);
    let mut removed_count = 0;

    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(LOG_FILE_NAME) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else { continue };
        let Ok(modified) = metadata.modified() else { continue };
        let modified_time: chrono::DateTime<Utc> = modified.into();

        if modified_time < cutoff_time {
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!("Failed to remove old log file {:?}: {}", path, e);
            } else {
                removed_count += 1;
            }
        }
    }

    if removed_count > 0 {
        tracing::info!(
            "Removed {} old log files (older than {} days)",
            removed_count,
            retention_days
        );
    }

    Ok(())
}

/// Start the periodic log cleanup task (daily).
pub fn start_cleanup_task(
    log_dir: PathBuf,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = std::time::Duration::from_secs(24 * 60 * 60);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = cleanup_old_logs(&log_dir, DEFAULT_LOG_RETENTION_DAYS) {
                        tracing::error!("Failed to cleanup old logs: {}", e);
                    }
                }
                _ = cancel_token.cancelled() => {
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_get_log_dir() {
        let data_dir = PathBuf::from("/test/data");
        assert_eq!(get_log_dir(&data_dir), PathBuf::from("/test/data/logs"));
    }

    #[test]
    fn test_cleanup_old_logs() {
        let temp_dir = TempDir::new().unwrap();
        let log_dir = temp_dir.path();

        let current_path = log_dir.join(LOG_FILE_NAME);
        let mut file = File::create(&current_path).unwrap();
        write!(file, "current").unwrap();

        // Unrelated files must never be touched
        let other_path = log_dir.join("notes.txt");
        File::create(&other_path).unwrap();

        cleanup_old_logs(log_dir, 5).unwrap();

        assert!(current_path.exists());
        assert!(other_path.exists());
    }

    #[test]
    fn test_cleanup_missing_dir_is_ok() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("nope");
        assert!(cleanup_old_logs(&missing, 5).is_ok());
    }
}
