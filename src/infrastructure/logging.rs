//! Operation-log setup: console output plus a daily-rotated file, with
//! a retention sweep for old log files.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::path::Path;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. Returns the guard that keeps
/// the file writer flushing; hold it for the process lifetime.
pub fn init_logging(logs_dir: &Path, verbose: bool) -> Result<WorkerGuard> {
    std::fs::create_dir_all(logs_dir).context("create logs directory")?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("robot")
        .filename_suffix("log")
        .build(logs_dir)
        .context("create rolling log file")?;
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("casare_robot={0},{0}", default_level)));

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .ok();
    Ok(guard)
}

/// Delete rotated log files older than the retention window. Returns
/// the number of files removed.
pub async fn cleanup_old_logs(logs_dir: &Path, retention_days: u32) -> Result<usize> {
    if !logs_dir.exists() {
        return Ok(0);
    }
    let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
    let mut deleted = 0;

    let mut entries = tokio::fs::read_dir(logs_dir)
        .await
        .context("read logs directory")?;
    while let Some(entry) = entries.next_entry().await.context("read log entry")? {
        let path = entry.path();
        let is_log = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.starts_with("log"))
            .unwrap_or(false);
        if !is_log || path.is_dir() {
            continue;
        }

        let metadata = tokio::fs::metadata(&path).await.context("log metadata")?;
        let modified: DateTime<Utc> = metadata.modified().context("log mtime")?.into();
        if modified < cutoff {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "could not delete old log");
                continue;
            }
            deleted += 1;
        }
    }

    if deleted > 0 {
        info!(count = deleted, "cleaned up old log files");
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cleanup_removes_only_old_logs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("robot.2024-01-01.log"), b"old").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"keep").unwrap();

        // With zero retention every log file is stale.
        let deleted = cleanup_old_logs(dir.path(), 0).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_cleanup_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert_eq!(cleanup_old_logs(&missing, 7).await.unwrap(), 0);
    }
}
